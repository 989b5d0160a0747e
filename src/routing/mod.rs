pub mod bucket;
pub mod table;

pub use bucket::Bucket;
pub use table::RoutingTable;
