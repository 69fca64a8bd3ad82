mod sockets;

pub use sockets::*;

#[cfg(test)]
pub mod test_utils;
