use std::path::Path;
use std::time::Duration;

use crate::config::StartupError;

const ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
}

/// Reads the database role credentials the platform mounts under
/// `<mount>/<db_name>-user/`. The mount can appear a moment after the pod
/// starts, so unreadable files are retried with a doubling delay.
pub async fn load_db_credentials(
    mount_path: &str,
    db_name: &str,
) -> Result<DbCredentials, StartupError> {
    let dir = Path::new(mount_path).join(format!("{db_name}-user"));

    let mut backoff = INITIAL_BACKOFF;
    let mut last_failure = String::new();
    for attempt in 1..=ATTEMPTS {
        match read_credentials(&dir) {
            Ok(creds) => return Ok(creds),
            Err(reason) => {
                tracing::warn!(attempt, %reason, "database credentials not readable yet");
                last_failure = reason;
            }
        }
        if attempt < ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    Err(StartupError {
        code: "ERR_CREDENTIALS_UNAVAILABLE",
        message: format!(
            "gave up reading credentials from {} after {} attempts: {}",
            dir.display(),
            ATTEMPTS,
            last_failure
        ),
    })
}

fn read_credentials(dir: &Path) -> Result<DbCredentials, String> {
    Ok(DbCredentials {
        username: read_credential_file(&dir.join("username"))?,
        password: read_credential_file(&dir.join("password"))?,
    })
}

fn read_credential_file(path: &Path) -> Result<String, String> {
    let raw =
        std::fs::read_to_string(path).map_err(|err| format!("{}: {}", path.display(), err))?;
    let value = raw.trim();
    if value.is_empty() {
        return Err(format!("{}: file is empty", path.display()));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn scratch_mount() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("arkiv_creds_{}", Ulid::new()));
        std::fs::create_dir_all(dir.join("sf-arkiv-user")).expect("create credential dir");
        dir
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn credentials_load_and_trim_trailing_newlines() {
        let mount = scratch_mount();
        let dir = mount.join("sf-arkiv-user");
        std::fs::write(dir.join("username"), "arkiv-user\n").expect("write username");
        std::fs::write(dir.join("password"), "s3cret\n").expect("write password");

        let creds = load_db_credentials(mount.to_str().expect("utf8 path"), "sf-arkiv")
            .await
            .expect("credentials load");
        assert_eq!(creds.username, "arkiv-user");
        assert_eq!(creds.password, "s3cret");

        let _ = std::fs::remove_dir_all(&mount);
    }

    #[test]
    fn missing_password_file_is_reported() {
        let mount = scratch_mount();
        let dir = mount.join("sf-arkiv-user");
        std::fs::write(dir.join("username"), "arkiv-user").expect("write username");

        let err = read_credentials(&dir).unwrap_err();
        assert!(err.contains("password"));

        let _ = std::fs::remove_dir_all(&mount);
    }

    #[test]
    fn blank_credential_file_is_rejected() {
        let mount = scratch_mount();
        let path = mount.join("sf-arkiv-user").join("username");
        std::fs::write(&path, "\n").expect("write blank file");

        let err = read_credential_file(&path).unwrap_err();
        assert!(err.contains("empty"));

        let _ = std::fs::remove_dir_all(&mount);
    }
}
