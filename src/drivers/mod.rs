//! Device drivers the network stack talks to

pub mod net;
