//! One-time class initialization.
//!
//! A class's initializer runs before the first message to the class or one
//! of its instances is dispatched, after its superclass's initializer.
//!
//! # Thread Safety
//!
//! - The first thread to reach an uninitialized class moves it to
//!   `Initializing` under the class's init gate and runs the initializer with
//!   no lock held.
//! - Other threads wait on the gate's condition variable until the class is
//!   `Initialized`.
//! - The initializing thread itself may message the class while its
//!   initializer runs: a per-thread set of classes being initialized lets
//!   those dispatches through.
//! - If the initializer panics the class is still marked `Initialized` and
//!   waiters are released; the panic continues on the initializing thread.

use crate::error::Result;
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassState};
use crate::runtime::lock::assert_no_locks_held;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::sync::Arc;

/// A class initializer.
pub type Initializer = Arc<dyn Fn(&Runtime, Class) + Send + Sync>;

thread_local! {
    static INITIALIZING: RefCell<Vec<Class>> = const { RefCell::new(Vec::new()) };
}

fn initializing_on_this_thread(class: Class) -> bool {
    INITIALIZING.with(|set| set.borrow().contains(&class))
}

/// Publishes `Initialized` when dropped, including during unwinding.
struct InitializationDone {
    class: Class,
}

impl Drop for InitializationDone {
    fn drop(&mut self) {
        let gate = self.class.gate();
        {
            let _guard = gate.lock();
            self.class.set_state(ClassState::Initialized);
        }
        gate.notify_all();

        INITIALIZING.with(|set| set.borrow_mut().retain(|&class| class != self.class));

        if std::thread::panicking() {
            warn!("initializer of {} panicked; class marked initialized", self.class);
        }
    }
}

impl Runtime {
    /// Realizes and initializes `class` (and its superclasses) if that has
    /// not happened yet.
    ///
    /// Dispatch does this on its own; calling it early moves the work out of
    /// the first message send. Passing a metaclass initializes its class.
    ///
    /// # Errors
    ///
    /// A realization error if the class or a superclass cannot be realized.
    ///
    /// # Panics
    ///
    /// Propagates a panic from an initializer, after marking its class
    /// initialized.
    pub fn initialize(&self, class: Class) -> Result<()> {
        self.check_owned(class)?;
        let class = class.instance_class();
        if class.is_initialized() {
            return Ok(());
        }

        self.realize(class)?;
        if let Some(superclass) = self.superclass(class) {
            self.initialize(superclass)?;
        }

        if initializing_on_this_thread(class) {
            return Ok(());
        }

        {
            let gate = class.gate();
            let mut guard = gate.lock();
            loop {
                match class.state() {
                    ClassState::Initialized => return Ok(()),
                    ClassState::Initializing => gate.wait(&mut guard),
                    ClassState::Unrealized | ClassState::Realized => {
                        class.set_state(ClassState::Initializing);
                        break;
                    }
                }
            }
        }

        INITIALIZING.with(|set| set.borrow_mut().push(class));
        let _done = InitializationDone { class };

        let initializer = self.store.read().class(class).initializer.clone();
        match initializer {
            Some(initializer) => {
                if self.options.print_initialize {
                    info!("INITIALIZE: calling initializer of {class}");
                }
                assert_no_locks_held("class initializer");
                initializer(self, class);
                if self.options.print_initialize {
                    info!("INITIALIZE: finished initializer of {class}");
                }
            }
            None => debug!("class {class} has no initializer"),
        }

        Ok(())
    }

    /// Dispatch-side initialization. Realization failures are left to the
    /// lookup, which forwards.
    pub(crate) fn ensure_initialized(&self, class: Class) {
        if let Err(err) = self.initialize(class) {
            debug!("cannot initialize {class}: {err}");
        }
    }
}
