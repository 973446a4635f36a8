//! Listing the entries of uploaded archives.
//!
//! Runs synchronously against a file on disk; call it from `spawn_blocking`.

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

/// List entry names of `path` if `mimetype` is a recognized archive format.
///
/// Returns an empty list for anything that is not an archive. Directory
/// entries keep their trailing `/`. The result is sorted.
pub fn list_archive_entries(mimetype: &str, path: &Path) -> io::Result<Vec<String>> {
    let essence = mimetype.split(';').next().unwrap_or(mimetype).trim();
    let open = || File::open(path).map(BufReader::new);

    let mut entries = match essence {
        "application/x-tar" => list_tar(open()?)?,
        "application/gzip" | "application/x-gzip" => list_tar(GzDecoder::new(open()?))?,
        "application/x-bzip" | "application/bzip2" | "application/x-bzip2" => {
            list_tar(BzDecoder::new(open()?))?
        }
        "application/zip" | "application/x-zip" | "application/x-zip-compressed" => {
            let archive = zip::ZipArchive::new(open()?).map_err(io::Error::other)?;
            archive.file_names().map(str::to_string).collect()
        }
        "application/x-rar" | "application/x-rar-compressed" | "application/vnd.rar" => {
            list_rar(path)?
        }
        _ => Vec::new(),
    };

    entries.sort();
    Ok(entries)
}

fn list_tar<R: Read>(input: R) -> io::Result<Vec<String>> {
    let mut archive = tar::Archive::new(input);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_dir() || kind.is_file() {
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            names.push(name);
        }
    }
    Ok(names)
}

fn list_rar(path: &Path) -> io::Result<Vec<String>> {
    let archive = unrar::Archive::new(path)
        .open_for_listing()
        .map_err(io::Error::other)?;
    let mut names = Vec::new();
    for entry in archive {
        let entry = entry.map_err(io::Error::other)?;
        let name = entry.filename.to_string_lossy().into_owned();
        if entry.is_directory() {
            names.push(format!("{name}/"));
        } else {
            names.push(name);
        }
    }
    Ok(names)
}
