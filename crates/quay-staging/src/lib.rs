//! Staging zones for Quay.
//!
//! Small content is not worth a storage deal on its own. It is staged into
//! per-group zones that fill up until they are worth a deal, then sealed
//! and handed to deal making:
//!
//! - [`StagingZoneManager`]: buckets content into zones and drives the
//!   `Open -> Full -> Sealed` lifecycle.
//! - [`DealCircuitBreaker`]: global switch that suspends new deals.
//! - [`ZoneSealer`]: background loop handing ready zones to a [`DealSink`].

mod breaker;
mod error;
mod manager;
mod sealer;
mod zone;


pub use breaker::DealCircuitBreaker;
pub use error::StagingError;
pub use manager::StagingZoneManager;
pub use sealer::{DealSink, SealPass, ZoneSealer};
pub use zone::{ContentItem, StagedItem, StagingZone, ZoneState};
