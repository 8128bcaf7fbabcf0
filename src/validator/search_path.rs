//! Validator search path
//!
//! While a validator runs, its staged directory is on a process-wide search
//! path so that it can find the files shipped with it. Only one validator may
//! run per process at a time; [`ValidatorScope`] holds that exclusive right
//! and removes the directory again when dropped, also during unwinding.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

static EXECUTION: Mutex<()> = Mutex::const_new(());
static SEARCH_PATH: StdMutex<Vec<PathBuf>> = StdMutex::new(Vec::new());

fn with_path<R>(f: impl FnOnce(&mut Vec<PathBuf>) -> R) -> R {
    let mut path = SEARCH_PATH
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut path)
}

/// Exclusive validator execution with `dir` on the search path
pub struct ValidatorScope {
    dir: PathBuf,
    _exclusive: MutexGuard<'static, ()>,
}

/// Wait for any other validator to finish, then put `dir` on the search path
pub async fn enter(dir: &Path) -> ValidatorScope {
    let exclusive = EXECUTION.lock().await;
    debug!("Adding {:?} to the validator search path", dir);
    with_path(|path| path.push(dir.to_path_buf()));

    ValidatorScope {
        dir: dir.to_path_buf(),
        _exclusive: exclusive,
    }
}

impl ValidatorScope {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for ValidatorScope {
    fn drop(&mut self) {
        with_path(|path| {
            if let Some(pos) = path.iter().rposition(|p| p == &self.dir) {
                path.remove(pos);
            }
        });
        debug!("Removed {:?} from the validator search path", self.dir);
    }
}

/// Directories currently on the search path, innermost last
pub fn current() -> Vec<PathBuf> {
    with_path(|path| path.clone())
}

/// Find `relative` in the search path, innermost directory first
pub fn resolve(relative: impl AsRef<Path>) -> Option<PathBuf> {
    let relative = relative.as_ref();
    with_path(|path| {
        path.iter()
            .rev()
            .map(|dir| dir.join(relative))
            .find(|candidate| candidate.exists())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_pushes_and_pops() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("expected.txt"), "42").unwrap();

        {
            let scope = enter(dir.path()).await;
            assert_eq!(scope.dir(), dir.path());
            assert!(current().contains(&dir.path().to_path_buf()));
            assert_eq!(
                resolve("expected.txt"),
                Some(dir.path().join("expected.txt"))
            );
            assert_eq!(resolve("missing.txt"), None);
        }

        assert!(!current().contains(&dir.path().to_path_buf()));
        assert_eq!(resolve("expected.txt"), None);
    }

    #[tokio::test]
    async fn test_scope_is_released_on_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let handle = tokio::spawn(async move {
            let _scope = enter(&path).await;
            panic!("validator crashed");
        });
        assert!(handle.await.is_err());

        assert!(!current().contains(&dir.path().to_path_buf()));
        // The exclusive lock is free again
        let _scope = enter(dir.path()).await;
    }
}
