//! filer-store: the content store contract and its OpenDAL implementation

pub mod health;
pub mod metered;
pub mod node;
pub mod opendal_store;
pub mod operator;
pub mod store;

pub use health::check_health;
pub use metered::{MeteredStore, StoreCounters};
pub use opendal_store::OpendalStore;
pub use operator::build_operator;
pub use store::ContentStore;
