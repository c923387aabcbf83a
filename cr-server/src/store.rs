use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

const PARTS_DIR: &str = "parts";
const PART_EXTENSION: &str = "part";

/// On-disk storage for uploaded parts and merged artifacts.
///
/// Layout under `root`:
/// `<session>/parts/<sequence>.part` for parts and `<session>_<unix_ms>.webm`
/// for merged artifacts. Callers only pass session ids the registry issued, so
/// ids are never taken from the wire unchecked.
#[derive(Clone, Debug)]
pub struct PartStore {
    root: PathBuf,
}

impl PartStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn write_part(&self, session_id: &str, sequence: u64, bytes: &[u8]) -> io::Result<()> {
        let path = self.part_path(session_id, sequence);
        write_atomically(&path, |file| file.write_all(bytes))
    }

    /// Concatenates the given parts, in the order given, into `file_name`.
    /// Returns the artifact size in bytes.
    pub fn concatenate(
        &self,
        session_id: &str,
        sequences: &[u64],
        file_name: &str,
    ) -> io::Result<u64> {
        let target = self.artifact_path(file_name);
        let mut total = 0u64;
        write_atomically(&target, |file| {
            for &sequence in sequences {
                let path = self.part_path(session_id, sequence);
                let mut part = fs::File::open(&path).map_err(|err| {
                    io::Error::new(
                        err.kind(),
                        format!("failed to open part {}: {err}", path.display()),
                    )
                })?;
                total += io::copy(&mut part, file)?;
            }
            Ok(())
        })?;
        Ok(total)
    }

    pub fn discard_session(&self, session_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(session_id)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn part_path(&self, session_id: &str, sequence: u64) -> PathBuf {
        self.session_dir(session_id)
            .join(PARTS_DIR)
            .join(format!("{sequence:010}.{PART_EXTENSION}"))
    }
}

fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> io::Result<()>,
) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);
    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        write(&mut file)?;
        file.sync_all()
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    fn scratch_store() -> PartStore {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "cr-server-store-{}-{seq}",
            std::process::id()
        ));
        PartStore::new(dir)
    }

    #[test]
    fn concatenate_follows_given_order_not_write_order() {
        let store = scratch_store();
        store.write_part("s", 2, b"cc").expect("write part 2");
        store.write_part("s", 0, b"a").expect("write part 0");
        store.write_part("s", 1, b"bbb").expect("write part 1");

        let bytes = store
            .concatenate("s", &[0, 1, 2], "s_1.webm")
            .expect("concatenate should succeed");
        assert_eq!(bytes, 6);
        let merged = fs::read(store.artifact_path("s_1.webm")).expect("artifact readable");
        assert_eq!(merged, b"abbbcc");

        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn concatenate_fails_without_leaving_partial_artifact() {
        let store = scratch_store();
        store.write_part("s", 0, b"a").expect("write part 0");

        let err = store
            .concatenate("s", &[0, 1], "s_2.webm")
            .expect_err("missing part should fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!store.artifact_path("s_2.webm").exists());

        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn rewriting_a_part_replaces_it() {
        let store = scratch_store();
        store.write_part("s", 0, b"first").expect("first write");
        store.write_part("s", 0, b"second").expect("second write");
        store
            .concatenate("s", &[0], "s_3.webm")
            .expect("concatenate should succeed");
        let merged = fs::read(store.artifact_path("s_3.webm")).expect("artifact readable");
        assert_eq!(merged, b"second");

        store.discard_session("s").expect("discard should succeed");
        store.discard_session("s").expect("discard is idempotent");
        let _ = fs::remove_dir_all(store.root());
    }
}
