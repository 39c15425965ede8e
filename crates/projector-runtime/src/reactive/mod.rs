#![forbid(unsafe_code)]

//! Change-tracking primitives the projection layer is built on.
//!
//! - [`Observable`]: a shared, version-tracked value with change
//!   notification via subscriber callbacks.
//! - [`Subscription`]: RAII guard that unsubscribes on drop.
//! - [`Memo`]: a value memoized against a dependency signature.
//! - [`BindingScope`]: collects the subscriptions of one consumer and
//!   releases them together.
//!
//! # Architecture
//!
//! Everything is single-threaded: `Rc<RefCell<..>>` for shared ownership,
//! no locks. Notification runs over a snapshot of the subscriber list with
//! no borrow held, so callbacks may read the observable, set it again, or
//! drop subscriptions.
//!
//! # Invariants
//!
//! 1. Version increments exactly once per accepted mutation.
//! 2. Subscribers are notified in registration order.
//! 3. A subscription released during a notification cycle receives no
//!    further callbacks, including later ones in the same cycle.
//! 4. Releasing a subscription twice is a no-op.
//! 5. `Memo` recomputes only when its key differs from the cached key.

pub mod memo;
pub mod observable;
pub mod scope;

pub use memo::Memo;
pub use observable::{Observable, Subscription};
pub use scope::BindingScope;
