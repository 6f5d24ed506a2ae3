//! The lifecycle contract every backend honors: selection by name,
//! idempotent shutdown, shutdown after failed startup.

use fspy_sdk::{Backend, BackendKind};
use tempdir::TempDir;

#[test]
fn selection_is_a_pure_name_lookup() {
    for kind in BackendKind::ALL {
        let backend = kind.create();
        assert_eq!(backend.name(), kind.name());
        assert_eq!(BackendKind::from_name(kind.name()), Some(kind));
    }
    assert_eq!(BackendKind::from_name(""), None);
    assert_eq!(BackendKind::from_name("kqueue"), None);
    assert!(BackendKind::ALL.contains(&BackendKind::host_default()));
}

#[test]
fn end_is_idempotent_for_every_backend() {
    let tmp = TempDir::new("contract").unwrap();
    for kind in BackendKind::ALL {
        let mut backend = kind.create();
        match backend.begin(Some(tmp.path())) {
            Ok(()) => {
                assert!(backend.end(), "{}: first end must release", kind.name());
                assert!(!backend.end(), "{}: second end must be a no-op", kind.name());
            }
            Err(_) => {
                // failed or unsupported begin: end stays safe and reports
                // nothing released
                assert!(!backend.end(), "{}: end after failed begin", kind.name());
                assert!(!backend.end());
            }
        }
    }
}

#[test]
fn end_without_begin_releases_nothing() {
    for kind in BackendKind::ALL {
        let mut backend = kind.create();
        assert!(!backend.end(), "{}: nothing to release", kind.name());
    }
}

#[test]
fn stop_handle_is_shared_and_idempotent() {
    let tmp = TempDir::new("contract").unwrap();
    for kind in BackendKind::ALL {
        let mut backend = kind.create();
        let began = backend.begin(Some(tmp.path())).is_ok();
        let handle = backend.stop_handle();
        let clone = handle.clone();
        clone.stop();
        clone.stop();
        assert!(!handle.is_running(), "{}: stop must flip the shared flag", kind.name());
        // for descriptor-based backends stop already released the handle,
        // so end finds nothing left
        if began && kind != BackendKind::Kdebug {
            assert!(!backend.end(), "{}: stop took the descriptor", kind.name());
        }
    }
}

#[cfg(target_os = "linux")]
#[test]
fn stopped_backend_run_returns_immediately() {
    use fspy_sdk::inotify::InotifyBackend;

    let tmp = TempDir::new("contract").unwrap();
    let mut backend = InotifyBackend::new();
    backend.begin(Some(tmp.path())).unwrap();
    backend.stop_handle().stop();
    let result = backend.run(&mut |_| true);
    assert!(result.is_ok());
    backend.end();
}
