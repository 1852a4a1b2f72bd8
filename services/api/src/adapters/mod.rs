pub mod db;
pub mod hosting;
pub mod marketplace;

pub use db::DbAdapter;
pub use hosting::OtreeAdapter;
pub use marketplace::{MturkAdapter, MturkConnector};
