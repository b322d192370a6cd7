//! Packs submitted source files into a tar stream for copy-in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mode of every packed file: rw for the owner, r for group and others.
pub const FILE_MODE: u32 = 0o644;

/// A named in-memory source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub data: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("writing tar header for {name:?}: {source}")]
    Header {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("writing tar stream: {0}")]
    Write(#[from] std::io::Error),
}

/// Encode `files` as a ustar archive, in order.
///
/// Names must fit the ustar name/prefix fields, be relative, and not contain
/// `..`. An empty list yields a valid empty archive.
pub fn encode(files: &[SourceFile]) -> Result<Vec<u8>, ArchiveError> {
    let mut builder = tar::Builder::new(Vec::new());

    for file in files {
        let mut header = tar::Header::new_ustar();
        header
            .set_path(&file.name)
            .map_err(|source| ArchiveError::Header {
                name: file.name.clone(),
                source,
            })?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(FILE_MODE);
        header.set_size(file.data.len() as u64);
        header.set_mtime(0);
        header.set_cksum();

        builder.append(&header, file.data.as_bytes())?;
    }

    Ok(builder.into_inner()?)
}
