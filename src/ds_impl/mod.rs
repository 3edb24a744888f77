pub mod camera;
pub mod chromatic;
pub mod concurrent_map;
pub mod efrb_batch_tree;
pub mod key;
pub mod leaf;
pub mod params;
pub mod pnb_batch_tree;
pub mod traverse;
pub mod vcas_batch_tree;

pub use self::camera::Camera;
pub use self::chromatic::{Balance, ChromaticTree};
pub use self::concurrent_map::{ConcurrentMap, KeySum, RangeMap};
pub use self::efrb_batch_tree::EFRBBatchTree;
pub use self::params::TreeParams;
pub use self::pnb_batch_tree::PnbBatchTree;
pub use self::traverse::TreeStats;
pub use self::vcas_batch_tree::VcasBatchTree;
