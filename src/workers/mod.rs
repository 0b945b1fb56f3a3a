pub mod args;
pub mod loopback;
