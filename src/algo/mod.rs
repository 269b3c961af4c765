//! Core allocation algorithms, leaves of the dependency graph first:
//! watermark (C1), freelist (C2), buddy (C3), slab (C4).

pub mod buddy;
pub mod freelist;
pub mod slab;
pub mod watermark;

pub use buddy::{Buddy, BuddyMeta, BuddyStats};
pub use freelist::{Freelist, FreelistMeta};
pub use slab::{Slab, SlabPageSource, SlabStats};
pub use watermark::{Watermark, WatermarkMeta};
