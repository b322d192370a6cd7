//! HTML pages.

use askama::Template;

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexPage;

#[derive(Template)]
#[template(path = "lang.html")]
pub struct LanguagePage<'a> {
    pub language: &'a str,
    pub version: &'a str,
}
