//! Child network substrate for candidate cells

pub mod cell_network;
pub mod ops;

pub use cell_network::{CellNetwork, CellNetworkBuilder};
pub use ops::OpLayer;
