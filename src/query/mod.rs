//! Read-side controllers: fetch, prefetch, pagination, background sync.
//!
//! Every controller follows the same shape: construct with stores plus an
//! options struct, observe through a `watch` channel, tear down explicitly
//! or by drop. State is only ever mutated by the owning controller's task
//! lineage; superseded work is discarded, never merged.

pub mod fetch;
pub mod infinite;
pub mod pager;
pub mod prefetch;
pub mod state;
pub mod sync;

pub use fetch::{FetchController, FetchOptions};
pub use infinite::{InfiniteQueryController, InfiniteQueryOptions, InfiniteState, PageResult};
pub use pager::{PagerOptions, PagerState, RemoteCollectionPager};
pub use prefetch::PrefetchCache;
pub use state::{DataSource, FetchState, PageState};
pub use sync::{BackgroundSyncController, SyncOptions};
