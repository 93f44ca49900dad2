//! Hardware security modules.
//!
//! The vendor library is reached through [`HsmModuleLoader`], injected by the
//! embedding application (typically a PKCS#11 binding). This module owns the
//! lifecycle: the module is loaded on first use and finalized once its last
//! source closes, and each fetch runs in its own session that is closed on
//! every exit path.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use super::{SecretSource, with_timeout};
use crate::connection::Timeout;
use crate::error::{ConfigurationError, Error, Result};
use crate::secret::{SecretBytes, SecretRef};

/// Loads a vendor HSM library.
pub trait HsmModuleLoader: Send + Sync {
    fn load(&self, library_path: &Path) -> Result<Arc<dyn HsmModule>>;
}

/// An initialized HSM library.
pub trait HsmModule: Send + Sync {
    /// Open a session on `slot` and log in with `pin`.
    fn open_session(&self, slot: u64, pin: &SecretBytes) -> Result<Box<dyn HsmSession>>;

    fn finalize(&self);
}

/// A logged-in session. Blocking.
pub trait HsmSession: Send {
    /// Read the secret value of the object labelled `alias`.
    fn read_secret(&mut self, alias: &str) -> Result<SecretBytes>;

    fn close(&mut self);
}

/// Slot number plus key alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmKeyId {
    slot: u64,
    alias: String,
}

impl HsmKeyId {
    pub fn new(slot: u64, alias: impl Into<String>) -> Result<Self, ConfigurationError> {
        let alias = alias.into();
        if alias.trim().is_empty() {
            return Err(ConfigurationError::InvalidDescriptor("hsm keyAlias is empty".into()));
        }
        Ok(Self { slot, alias })
    }
}

impl fmt::Display for HsmKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}/{}", self.slot, self.alias)
    }
}

/// Closes the session when dropped, including during unwinding.
struct ScopedSession(Box<dyn HsmSession>);

impl Drop for ScopedSession {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// A vendor library shared by every [`HsmSecretSource`] built on the same path.
///
/// Loaded on the first fetch through any holder and finalized when the last
/// holder closes. Finalization waits for fetches still running on the
/// blocking pool, including ones whose caller already timed out.
pub struct HsmModuleHandle {
    library_path: PathBuf,
    loader: Arc<dyn HsmModuleLoader>,
    module: Mutex<Option<Arc<dyn HsmModule>>>,
    holders: AtomicUsize,
    in_flight: Arc<RwLock<()>>,
}

impl HsmModuleHandle {
    pub fn new(
        library_path: impl Into<PathBuf>,
        loader: Arc<dyn HsmModuleLoader>,
    ) -> Result<Arc<Self>, ConfigurationError> {
        let library_path = library_path.into();
        crate::secret::ensure_readable(&library_path)?;
        Ok(Arc::new(Self {
            library_path,
            loader,
            module: Mutex::new(None),
            holders: AtomicUsize::new(0),
            in_flight: Arc::new(RwLock::new(())),
        }))
    }

    pub fn is_loaded(&self) -> bool {
        self.module.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn loaded(&self) -> Result<Arc<dyn HsmModule>> {
        let mut module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(module) = module.as_ref() {
            return Ok(module.clone());
        }
        let loaded = self.loader.load(&self.library_path)?;
        tracing::debug!(library = %self.library_path.display(), "loaded HSM module");
        *module = Some(loaded.clone());
        Ok(loaded)
    }

    async fn release(&self) {
        let _exclusive = self.in_flight.write().await;
        // A holder may have reopened while in-flight fetches drained.
        if self.holders.load(Ordering::SeqCst) > 0 {
            return;
        }
        let Some(module) = self.module.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        if tokio::task::spawn_blocking(move || module.finalize()).await.is_err() {
            tracing::warn!(library = %self.library_path.display(), "HSM finalize panicked");
        } else {
            tracing::debug!(library = %self.library_path.display(), "finalized HSM module");
        }
    }
}

/// Hands out one [`HsmModuleHandle`] per library path.
#[derive(Default)]
pub struct HsmModules {
    handles: Mutex<HashMap<PathBuf, Arc<HsmModuleHandle>>>,
}

impl HsmModules {
    pub fn handle(
        &self,
        library_path: &Path,
        loader: &Arc<dyn HsmModuleLoader>,
    ) -> Result<Arc<HsmModuleHandle>, ConfigurationError> {
        crate::secret::ensure_readable(library_path)?;
        let key = std::fs::canonicalize(library_path).unwrap_or_else(|_| library_path.to_path_buf());
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handles.get(&key) {
            return Ok(handle.clone());
        }
        let handle = HsmModuleHandle::new(library_path, loader.clone())?;
        handles.insert(key, handle.clone());
        Ok(handle)
    }
}

pub struct HsmSecretSource {
    module: Arc<HsmModuleHandle>,
    pin: SecretRef,
    timeout: Option<Timeout>,
    open: AtomicBool,
}

impl HsmSecretSource {
    /// A source with a module of its own.
    pub fn new(
        library_path: impl Into<PathBuf>,
        pin: SecretRef,
        timeout: Option<Timeout>,
        loader: Arc<dyn HsmModuleLoader>,
    ) -> Result<Self, ConfigurationError> {
        Self::with_module(HsmModuleHandle::new(library_path, loader)?, pin, timeout)
    }

    /// A source sharing `module` with other holders.
    pub fn with_module(
        module: Arc<HsmModuleHandle>,
        pin: SecretRef,
        timeout: Option<Timeout>,
    ) -> Result<Self, ConfigurationError> {
        pin.validate()?;
        module.holders.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            module,
            pin,
            timeout,
            open: AtomicBool::new(true),
        })
    }

    fn timeout(&self) -> Option<Duration> {
        Timeout::budget(self.timeout)
    }

    pub fn is_loaded(&self) -> bool {
        self.module.is_loaded()
    }

    /// Fetching after close takes the module back up.
    fn reopen(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.module.holders.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl SecretSource for HsmSecretSource {
    type Id = HsmKeyId;

    fn backend(&self) -> &'static str {
        "hsm"
    }

    fn fetch<'a>(&'a self, id: &'a HsmKeyId) -> BoxFuture<'a, Result<SecretBytes>> {
        async move {
            self.reopen();
            let pin = self.pin.resolve()?;
            let module = self.module.clone();
            let id = id.clone();

            with_timeout(self.timeout(), async move {
                let in_flight = module.in_flight.clone().read_owned().await;
                let task = tokio::task::spawn_blocking(move || {
                    let _in_flight = in_flight;
                    let module = module.loaded()?;
                    let mut session = ScopedSession(module.open_session(id.slot, &pin)?);
                    drop(pin);
                    session.0.read_secret(&id.alias)
                });
                task.await
                    .map_err(|e| Error::connection(format!("HSM task failed: {e}")))?
            })
            .await
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if !self.open.swap(false, Ordering::SeqCst) {
                return;
            }
            if self.module.holders.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.module.release().await;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counters {
        loads: AtomicUsize,
        opened: AtomicUsize,
        closed: AtomicUsize,
        finalized: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Stall(Duration),
    }

    struct MockLoader {
        counters: Arc<Counters>,
        behaviour: Arc<Mutex<Behaviour>>,
    }

    struct MockModule {
        counters: Arc<Counters>,
        behaviour: Arc<Mutex<Behaviour>>,
    }

    struct MockSession {
        counters: Arc<Counters>,
        behaviour: Arc<Mutex<Behaviour>>,
    }

    impl HsmModuleLoader for MockLoader {
        fn load(&self, _library_path: &Path) -> Result<Arc<dyn HsmModule>> {
            self.counters.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockModule {
                counters: self.counters.clone(),
                behaviour: self.behaviour.clone(),
            }))
        }
    }

    impl HsmModule for MockModule {
        fn open_session(&self, _slot: u64, pin: &SecretBytes) -> Result<Box<dyn HsmSession>> {
            if pin.expose_secret() != b"1234" {
                return Err(Error::connection("login failed"));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                counters: self.counters.clone(),
                behaviour: self.behaviour.clone(),
            }))
        }

        fn finalize(&self) {
            self.counters.finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl HsmSession for MockSession {
        fn read_secret(&mut self, alias: &str) -> Result<SecretBytes> {
            let behaviour = *self.behaviour.lock().unwrap();
            match behaviour {
                Behaviour::Succeed => Ok(SecretBytes::new(vec![9u8; 32])),
                Behaviour::Fail => Err(Error::not_found(format!("no object labelled {alias}"))),
                Behaviour::Panic => panic!("vendor library crashed"),
                Behaviour::Stall(duration) => {
                    std::thread::sleep(duration);
                    Ok(SecretBytes::new(vec![9u8; 32]))
                }
            }
        }

        fn close(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        source: HsmSecretSource,
        counters: Arc<Counters>,
        behaviour: Arc<Mutex<Behaviour>>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("libvendor-pkcs11.so");
        std::fs::write(&library, b"").unwrap();
        let pin = dir.path().join("pin");
        std::fs::write(&pin, "1234\n").unwrap();

        let counters = Arc::new(Counters::default());
        let behaviour = Arc::new(Mutex::new(Behaviour::Succeed));
        let loader = Arc::new(MockLoader {
            counters: counters.clone(),
            behaviour: behaviour.clone(),
        });
        let source = HsmSecretSource::new(library, SecretRef::File(pin), None, loader).unwrap();
        Fixture { source, counters, behaviour, _dir: dir }
    }

    #[tokio::test]
    async fn session_closed_after_success() {
        let fx = fixture();
        let id = HsmKeyId::new(0, "eth-signer").unwrap();
        let secret = fx.source.fetch(&id).await.unwrap();
        assert_eq!(secret.len(), 32);
        assert_eq!(fx.counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(fx.counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_closed_after_failure_and_panic() {
        let fx = fixture();
        let id = HsmKeyId::new(0, "eth-signer").unwrap();

        *fx.behaviour.lock().unwrap() = Behaviour::Fail;
        assert!(matches!(fx.source.fetch(&id).await, Err(Error::NotFound(_))));

        *fx.behaviour.lock().unwrap() = Behaviour::Panic;
        assert!(matches!(fx.source.fetch(&id).await, Err(Error::Connection(_))));

        assert_eq!(fx.counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(fx.counters.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn module_loaded_once_and_finalized_on_close() {
        let fx = fixture();
        let id = HsmKeyId::new(3, "eth-signer").unwrap();
        assert!(!fx.source.is_loaded());
        fx.source.fetch(&id).await.unwrap();
        fx.source.fetch(&id).await.unwrap();
        assert_eq!(fx.counters.loads.load(Ordering::SeqCst), 1);

        fx.source.close().await;
        fx.source.close().await;
        assert_eq!(fx.counters.finalized.load(Ordering::SeqCst), 1);
        assert!(!fx.source.is_loaded());
    }

    #[tokio::test]
    async fn shared_module_finalized_after_last_holder_closes() {
        let fx = fixture();
        let other = HsmSecretSource::with_module(
            fx.source.module.clone(),
            SecretRef::File(fx._dir.path().join("pin")),
            None,
        )
        .unwrap();
        let id = HsmKeyId::new(0, "eth-signer").unwrap();
        fx.source.fetch(&id).await.unwrap();
        other.fetch(&id).await.unwrap();
        assert_eq!(fx.counters.loads.load(Ordering::SeqCst), 1);

        fx.source.close().await;
        assert_eq!(fx.counters.finalized.load(Ordering::SeqCst), 0);
        other.fetch(&id).await.unwrap();

        other.close().await;
        assert_eq!(fx.counters.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(fx.counters.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_waits_for_stalled_fetch() {
        let fx = fixture();
        let source = HsmSecretSource::with_module(
            fx.source.module.clone(),
            SecretRef::File(fx._dir.path().join("pin")),
            Some(Timeout::After(Duration::from_millis(20))),
        )
        .unwrap();
        fx.source.close().await;
        *fx.behaviour.lock().unwrap() = Behaviour::Stall(Duration::from_millis(300));

        let id = HsmKeyId::new(0, "eth-signer").unwrap();
        assert!(matches!(source.fetch(&id).await, Err(Error::Timeout(_))));
        assert_eq!(fx.counters.closed.load(Ordering::SeqCst), 0);

        source.close().await;
        // The session ended before the module was finalized.
        assert_eq!(fx.counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.counters.finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_shares_one_handle_per_library() {
        let fx = fixture();
        let modules = HsmModules::default();
        let loader = fx.source.module.loader.clone();
        let library = fx._dir.path().join("libvendor-pkcs11.so");
        let first = modules.handle(&library, &loader).unwrap();
        let second = modules.handle(&fx._dir.path().join(".").join("libvendor-pkcs11.so"), &loader).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(modules.handle(Path::new("/nonexistent/lib.so"), &loader).is_err());
    }

    #[test]
    fn missing_library_is_configuration_error() {
        let fx = fixture();
        let result = HsmSecretSource::new(
            "/nonexistent/libvendor-pkcs11.so",
            SecretRef::Env("PATH".into()),
            None,
            fx.source.module.loader.clone(),
        );
        assert!(matches!(result, Err(ConfigurationError::UnreadableFile { .. })));
    }
}
