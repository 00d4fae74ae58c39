use std::env;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use zip::ZipArchive;
use zip::result::ZipError;

#[derive(Debug)]
pub enum SourceError {
    NotFound(String),
    Io(PathBuf, io::Error),
    Archive(PathBuf, ZipError)
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SourceError::NotFound(ref name) => write!(f, "class {} was not found on the classpath", name),
            SourceError::Io(ref path, ref err) => write!(f, "error reading {}: {}", path.display(), err),
            SourceError::Archive(ref path, ref err) => write!(f, "error reading archive {}: {}", path.display(), err)
        }
    }
}

#[derive(Debug, Clone)]
enum SourceEntry {
    Directory(PathBuf),
    Archive(PathBuf)
}

/// Locates raw class bytes on an ordered classpath of directories and
/// archives. Archive readers are opened per read and released immediately;
/// nothing is held open between lookups, so a source may be shared
/// read-only across sessions.
#[derive(Debug, Clone)]
pub struct ClassSource {
    entries: Vec<SourceEntry>
}

/// Expands a leading `~/` against the current user home.
pub fn expand_user_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        };
    };

    PathBuf::from(path)
}

fn is_archive(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jar") | Some("zip") => true,
        _ => false
    }
}

impl ClassSource {
    pub fn from_classpath(paths: &[PathBuf]) -> ClassSource {
        ClassSource {
            entries: paths.iter().map(|p| {
                let p = match p.to_str() {
                    Some(s) => expand_user_home(s),
                    None => p.clone()
                };

                if is_archive(&p) {
                    SourceEntry::Archive(p)
                } else {
                    SourceEntry::Directory(p)
                }
            }).collect()
        }
    }

    /// Raw bytes of the named class, searching classpath entries in order.
    pub fn class_bytes(&self, name: &str) -> Result<Vec<u8>, SourceError> {
        for entry in self.entries.iter() {
            match *entry {
                SourceEntry::Directory(ref dir) => {
                    let path = dir.join(Path::new(name)).with_extension("class");

                    if path.is_file() {
                        let mut bytes = vec![];
                        File::open(&path)
                            .and_then(|mut f| f.read_to_end(&mut bytes))
                            .map_err(|err| SourceError::Io(path.clone(), err))?;
                        return Result::Ok(bytes);
                    };
                },
                SourceEntry::Archive(ref path) => {
                    match self.archive_bytes(path, name) {
                        Result::Ok(Some(bytes)) => {
                            return Result::Ok(bytes);
                        },
                        Result::Ok(None) => {},
                        Result::Err(err) => {
                            return Result::Err(err);
                        }
                    };
                }
            };
        };

        Result::Err(SourceError::NotFound(name.to_owned()))
    }

    fn archive_bytes(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>, SourceError> {
        let file = File::open(path).map_err(|err| SourceError::Io(path.to_owned(), err))?;
        let mut archive = ZipArchive::new(BufReader::new(file))
            .map_err(|err| SourceError::Archive(path.to_owned(), err))?;

        let entry_name = format!("{}.class", name);
        let result = match archive.by_name(&entry_name) {
            Result::Ok(mut entry) => {
                let mut bytes = vec![];
                entry.read_to_end(&mut bytes).map_err(|err| SourceError::Io(path.to_owned(), err))?;
                Result::Ok(Some(bytes))
            },
            Result::Err(ZipError::FileNotFound) => Result::Ok(None),
            Result::Err(err) => Result::Err(SourceError::Archive(path.to_owned(), err))
        };
        result
    }
}
