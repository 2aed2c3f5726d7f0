use std::cell::RefCell;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, BufReader, Error, ErrorKind, Read};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::read_file;

/// Result of asking the classpath for a file. A damaged archive is reported
/// separately from a missing entry so the caller can distinguish
/// `ClassNotFoundException` from a corrupt jar.
#[derive(Debug)]
pub enum ClasspathLookup {
    Found(Vec<u8>),
    NotFound,
    Corrupt(String),
}

enum ClasspathEntry {
    Directory {
        // Relative path (with '/' separators) -> absolute file path
        index: HashMap<String, PathBuf>,
    },
    Jar {
        path: PathBuf,
        archive: RefCell<ZipArchive<BufReader<File>>>,
    },
}

/// An ordered list of directories and jar files searched for class files and
/// resources. Entries are separated by ':' in the usual java fashion.
pub struct ClassPath {
    entries: Vec<ClasspathEntry>,
    description: String,
}

impl ClassPath {
    pub fn parse(classpath: &str) -> io::Result<Self> {
        let mut entries = Vec::new();

        for piece in classpath.split(':').filter(|x| !x.is_empty()) {
            entries.push(ClassPath::open_entry(Path::new(piece))?);
        }

        info!("class path: {}", classpath);
        Ok(ClassPath {
            entries,
            description: classpath.to_string(),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn open_entry(path: &Path) -> io::Result<ClasspathEntry> {
        if path.is_dir() {
            return Ok(ClasspathEntry::Directory { index: ClassPath::index_directory(path) });
        }

        if path.is_file() && path.extension().and_then(OsStr::to_str) == Some("jar") {
            debug!("opening jar {}", path.display());
            let archive = ZipArchive::new(BufReader::new(File::open(path)?)).map_err(|e| {
                Error::new(
                    ErrorKind::InvalidData,
                    format!("unable to read jar {}: {}", path.display(), e),
                )
            })?;

            return Ok(ClasspathEntry::Jar {
                path: path.to_path_buf(),
                archive: RefCell::new(archive),
            });
        }

        Err(Error::new(
            ErrorKind::NotFound,
            format!("classpath entry {} is not a directory or jar", path.display()),
        ))
    }

    fn index_directory(root: &Path) -> HashMap<String, PathBuf> {
        let mut index = HashMap::new();

        for entry in WalkDir::new(root).sort_by_file_name().into_iter().flatten() {
            if !entry.path().is_file() {
                continue;
            }

            if let Ok(relative) = entry.path().strip_prefix(root) {
                let mut name = String::new();
                for component in relative.components() {
                    if !name.is_empty() {
                        name.push('/');
                    }
                    name.push_str(&component.as_os_str().to_string_lossy());
                }
                index.insert(name, entry.path().to_path_buf());
            }
        }

        debug!("indexed {} files under {}", index.len(), root.display());
        index
    }

    /// Search the entries in order for a relative path such as
    /// `java/lang/Object.class`.
    pub fn lookup(&self, relative: &str) -> ClasspathLookup {
        for entry in &self.entries {
            match entry {
                ClasspathEntry::Directory { index } => {
                    if let Some(path) = index.get(relative) {
                        return match read_file(&path.to_string_lossy()) {
                            Ok(bytes) => ClasspathLookup::Found(bytes),
                            Err(e) => ClasspathLookup::Corrupt(format!(
                                "unable to read {}: {}",
                                path.display(),
                                e
                            )),
                        };
                    }
                }
                ClasspathEntry::Jar { path, archive } => {
                    let mut archive = archive.borrow_mut();
                    match archive.by_name(relative) {
                        Ok(mut zipped) => {
                            let mut bytes = Vec::with_capacity(zipped.size() as usize);
                            return match zipped.read_to_end(&mut bytes) {
                                Ok(_) => ClasspathLookup::Found(bytes),
                                Err(e) => ClasspathLookup::Corrupt(format!(
                                    "unable to inflate {} from {}: {}",
                                    relative,
                                    path.display(),
                                    e
                                )),
                            };
                        }
                        Err(ZipError::FileNotFound) => {}
                        Err(e) => {
                            return ClasspathLookup::Corrupt(format!(
                                "damaged jar {}: {}",
                                path.display(),
                                e
                            ))
                        }
                    };
                }
            }
        }

        ClasspathLookup::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("excelsa-classpath-{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("com/example")).unwrap();
        dir
    }

    #[test]
    fn directory_lookup() {
        let dir = scratch_dir("dir");
        fs::write(dir.join("com/example/Main.class"), [0xCA, 0xFE]).unwrap();

        let classpath = ClassPath::parse(&dir.to_string_lossy()).unwrap();
        match classpath.lookup("com/example/Main.class") {
            ClasspathLookup::Found(bytes) => assert_eq!(bytes, [0xCA, 0xFE]),
            x => panic!("unexpected result {:?}", x),
        }

        assert!(matches!(
            classpath.lookup("com/example/Missing.class"),
            ClasspathLookup::NotFound
        ));
    }

    #[test]
    fn missing_entry_is_an_error() {
        assert!(ClassPath::parse("/definitely/not/a/real/path").is_err());
    }

    #[test]
    fn empty_segments_are_skipped() {
        let dir = scratch_dir("segments");
        let text = format!(":{}:", dir.to_string_lossy());
        assert!(ClassPath::parse(&text).is_ok());
    }
}
