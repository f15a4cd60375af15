use crate::config::GfxConfig;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

/// Process-wide state shared by the graphics system, its devices and surfaces.
///
/// Construct it once at start-up and hand an `Arc` to everything that touches
/// GPU objects. All creation, destruction and command recording happens while
/// the recursive lock is held, so nested entry points (a surface calling into
/// its device, a delegate calling back into the surface) can lock again freely.
#[derive(Debug)]
pub struct GraphicsContext {
    lock: ReentrantMutex<()>,
    config: GfxConfig,
}

impl GraphicsContext {
    pub fn new(config: GfxConfig) -> Arc<Self> {
        Arc::new(Self {
            lock: ReentrantMutex::new(()),
            config,
        })
    }

    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// True while the calling thread holds the lock. Used in debug assertions
    /// by entry points that expect their caller to hold it already.
    pub fn is_held(&self) -> bool {
        self.lock.is_owned_by_current_thread()
    }

    pub fn config(&self) -> &GfxConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_reentrant() {
        let context = GraphicsContext::new(GfxConfig::default());
        assert!(!context.is_held());
        {
            let _outer = context.lock();
            let _inner = context.lock();
            assert!(context.is_held());
        }
        assert!(!context.is_held());
    }

    #[test]
    fn lock_held_elsewhere_is_not_held_here() {
        let context = GraphicsContext::new(GfxConfig::default());
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let context = context.clone();
            std::thread::spawn(move || {
                let _guard = context.lock();
                assert!(context.is_held());
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };

        locked_rx.recv().unwrap();
        assert!(!context.is_held());
        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(!context.is_held());
    }
}
