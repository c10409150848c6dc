use crate::{Backend, Error, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Filesystem is the reference Backend: one sub-directory per key, one file
/// per version. The file name encodes the version's absolute expiration
/// deadline, its creation time, and its type:
///
/// ```text
/// <root>/<key>/EEEEEEEEEEEE-SSSSSSSSSSSS-UUUUUU.TYPE.XXXXXX
/// ```
///
/// where `E` is the deadline in zero-padded epoch seconds (all zeros means
/// never expire), `S.U` is creation seconds and microseconds, and `XXXXXX`
/// is the random suffix of an exclusive-create temp file. Version files are
/// written under their final name and never renamed; any file matching the
/// pattern is committed. Concurrent writers therefore coexist as distinct
/// versions, reconciled by the Store's merge policy on read.
#[derive(Debug, Clone)]
pub struct Filesystem {
    root: PathBuf,
}

// Fixed-width fields of a version file name.
const DEADLINE_DIGITS: usize = 12;
const SECONDS_DIGITS: usize = 12;
const MICROS_DIGITS: usize = 6;
const SUFFIX_LEN: usize = 6;

impl Filesystem {
    /// Build a backend over `root`, which is created out-of-band. Keys are
    /// used verbatim as directory names: callers that accept keys containing
    /// `/`, `..`, or other non-portable sequences must escape them first, as
    /// behaviour for such keys is implementation-defined.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Backend for Filesystem {
    fn get(&self, key: &str) -> Result<Vec<Value>, Error> {
        let dir = self.key_dir(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound)
            }
            Err(err) => return Err(err.into()),
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let Some(parsed) = VersionName::parse(&name) else {
                tracing::warn!(key, file = %name, "skipping unrecognized file in key directory");
                continue;
            };
            // Expired versions are garbage-collected on read. The deadline
            // is strict: a version is visible for its full interval.
            if parsed.deadline != 0 && parsed.deadline < now {
                tracing::debug!(key, file = %name, "unlinking expired version");
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let data = fs::read(entry.path())?;
            versions.push(Value {
                data: data.into(),
                expiration: parsed.relative_expiration(),
                creation: parsed.creation(),
                kind: parsed.kind,
            });
        }

        if versions.is_empty() {
            // Opportunistic: a concurrent writer re-creates the directory as
            // needed, so failure to remove it is fine.
            let _ = fs::remove_dir(&dir);
            return Err(Error::NotFound);
        }
        Ok(versions)
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), Error> {
        let dir = self.key_dir(key);
        if !dir.is_dir() {
            fs::create_dir_all(&dir)?;
        }

        let created = value
            .creation
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let deadline = if value.expiration > 0 {
            created.as_secs() + u64::from(value.expiration)
        } else {
            0
        };
        let prefix = format!(
            "{:0dw$}-{:0sw$}-{:0uw$}.{}.",
            deadline,
            created.as_secs(),
            created.subsec_micros(),
            value.kind,
            dw = DEADLINE_DIGITS,
            sw = SECONDS_DIGITS,
            uw = MICROS_DIGITS,
        );

        // Exclusive-create under the final name; cleanup is disabled up
        // front so the file survives every exit path, and a failed write is
        // left for the read-side GC.
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix("")
            .rand_bytes(SUFFIX_LEN)
            .disable_cleanup(true)
            .tempfile_in(&dir)?;
        file.write_all(&value.data)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let dir = self.key_dir(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with('.') {
                let _ = fs::remove_file(entry.path());
            }
        }
        // A concurrent writer may have dropped a new version in the
        // meantime; failing to remove the directory is not an error.
        let _ = fs::remove_dir(&dir);
        Ok(())
    }
}

// Parsed form of a version file name.
struct VersionName {
    deadline: u64,
    seconds: u64,
    micros: u32,
    kind: String,
}

impl VersionName {
    fn parse(name: &str) -> Option<VersionName> {
        let bytes = name.as_bytes();
        // Shortest legal name: all time fields, separators, an empty type,
        // and the random suffix.
        let min = DEADLINE_DIGITS + 1 + SECONDS_DIGITS + 1 + MICROS_DIGITS + 2 + SUFFIX_LEN;
        let micros_end = DEADLINE_DIGITS + 1 + SECONDS_DIGITS + 1 + MICROS_DIGITS;
        if bytes.len() < min
            || bytes[DEADLINE_DIGITS] != b'-'
            || bytes[DEADLINE_DIGITS + 1 + SECONDS_DIGITS] != b'-'
            || bytes[micros_end] != b'.'
            || bytes[bytes.len() - SUFFIX_LEN - 1] != b'.'
        {
            return None;
        }
        let deadline = name[..DEADLINE_DIGITS].parse().ok()?;
        let seconds = name[DEADLINE_DIGITS + 1..DEADLINE_DIGITS + 1 + SECONDS_DIGITS]
            .parse()
            .ok()?;
        let micros = name[DEADLINE_DIGITS + 1 + SECONDS_DIGITS + 1..micros_end]
            .parse()
            .ok()?;
        let kind = name[micros_end + 1..bytes.len() - SUFFIX_LEN - 1].to_string();
        Some(VersionName {
            deadline,
            seconds,
            micros,
            kind,
        })
    }

    fn creation(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.seconds) + Duration::from_micros(u64::from(self.micros))
    }

    // Recover the set-time relative expiration from the absolute deadline.
    fn relative_expiration(&self) -> u32 {
        if self.deadline == 0 {
            0
        } else {
            self.deadline.saturating_sub(self.seconds) as u32
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Filesystem, VersionName};
    use crate::{Backend, Error, Newest, Store, Value};
    use pretty_assertions::assert_eq;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn value_at(data: &str, expiration: u32, creation: SystemTime) -> Value {
        Value {
            data: data.as_bytes().to_vec().into(),
            kind: "txt".into(),
            expiration,
            creation,
        }
    }

    #[test]
    fn test_set_then_get() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());

        let value = Value::new(&b"A value"[..], "txt", 10);
        fs.set("k1", &value).unwrap();

        let versions = fs.get("k1").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].data, "A value");
        assert_eq!(versions[0].kind, "txt");
        assert_eq!(versions[0].expiration, 10);
    }

    #[test]
    fn test_version_file_format_is_exact() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());

        let creation = UNIX_EPOCH + Duration::from_secs(1234567890) + Duration::from_micros(123456);
        fs.set("k", &value_at("x", 10, creation)).unwrap();

        let names: Vec<String> = std::fs::read_dir(root.path().join("k"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);

        let expect = "001234567900-001234567890-123456.txt.";
        assert!(
            names[0].starts_with(expect) && names[0].len() == expect.len() + 6,
            "unexpected version file name {:?}",
            names[0]
        );

        // And the name parses back to the same metadata.
        let parsed = VersionName::parse(&names[0]).unwrap();
        assert_eq!(parsed.deadline, 1234567900);
        assert_eq!(parsed.creation(), creation);
        assert_eq!(parsed.relative_expiration(), 10);
        assert_eq!(parsed.kind, "txt");
    }

    #[test]
    fn test_never_expire_is_all_zeros() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());

        // A version written long ago with no expiry stays visible.
        let creation = UNIX_EPOCH + Duration::from_secs(1000);
        fs.set("old", &value_at("keep", 0, creation)).unwrap();

        let names: Vec<String> = std::fs::read_dir(root.path().join("old"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names[0].starts_with("000000000000-"));

        let versions = fs.get("old").unwrap();
        assert_eq!(versions[0].data, "keep");
    }

    #[test]
    fn test_expired_version_is_collected_on_read() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());

        // Deadline passed two seconds ago.
        let creation = SystemTime::now() - Duration::from_secs(3);
        fs.set("gone", &value_at("stale", 1, creation)).unwrap();

        assert!(matches!(fs.get("gone"), Err(Error::NotFound)));

        // The version file was unlinked, and the directory opportunistically
        // removed with it.
        assert!(!root.path().join("gone").exists());
    }

    #[test]
    fn test_concurrent_versions_merge_on_read() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());

        let t0 = SystemTime::now();
        fs.set("k", &value_at("first", 60, t0)).unwrap();
        fs.set("k", &value_at("second", 60, t0 + Duration::from_secs(1)))
            .unwrap();

        // Both versions are live; no blending occurs.
        let versions = fs.get("k").unwrap();
        assert_eq!(versions.len(), 2);
        for v in &versions {
            assert!(v.data == "first" || v.data == "second");
        }

        // A strictly ordered single writer reads its own last write through
        // the Newest policy.
        let store = Store::with_merge_policy(fs, Newest);
        assert_eq!(store.get("k").unwrap().data, "second");
    }

    #[test]
    fn test_value_is_visible_for_its_full_interval() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());
        let store = crate::Store::new(fs);

        store.set("k", &Value::new(&b"A"[..], "txt", 1)).unwrap();
        assert_eq!(store.get("k").unwrap().data, "A");

        std::thread::sleep(Duration::from_secs(2));
        assert!(matches!(store.get("k"), Err(Error::NotFound)));

        // The expired version was unlinked on that read.
        let dir = root.path().join("k");
        if dir.exists() {
            let files: Vec<_> = std::fs::read_dir(&dir)
                .unwrap()
                .filter(|e| {
                    !e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .starts_with('.')
                })
                .collect();
            assert!(files.is_empty());
        }
    }

    #[test]
    fn test_remove() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());

        fs.set("k", &Value::new(&b"v"[..], "txt", 0)).unwrap();
        fs.remove("k").unwrap();
        assert!(matches!(fs.get("k"), Err(Error::NotFound)));

        // Removing an absent key is fine.
        fs.remove("k").unwrap();
    }

    #[test]
    fn test_foreign_files_are_skipped() {
        let root = tempfile::TempDir::new().unwrap();
        let fs = Filesystem::new(root.path());

        fs.set("k", &Value::new(&b"v"[..], "txt", 0)).unwrap();
        std::fs::write(root.path().join("k").join("README"), b"not a version").unwrap();
        std::fs::write(root.path().join("k").join(".hidden"), b"dotfile").unwrap();

        let versions = fs.get("k").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].data, "v");
    }

    #[test]
    fn test_version_name_rejects_malformed() {
        for name in [
            "",
            "README",
            "001234567900-001234567890-123456", // no type or suffix
            "x01234567900-001234567890-123456.txt.abcdef", // non-digit
            "001234567900+001234567890-123456.txt.abcdef", // wrong separator
        ] {
            assert!(VersionName::parse(name).is_none(), "accepted {name:?}");
        }

        // Empty type strings are within the format.
        let parsed = VersionName::parse("000000000000-000000000001-000002..abcdef").unwrap();
        assert_eq!(parsed.kind, "");
        assert_eq!(parsed.seconds, 1);
        assert_eq!(parsed.micros, 2);
    }
}
