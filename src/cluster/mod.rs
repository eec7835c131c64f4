pub mod compress;
pub mod master;
pub mod protocol;
pub mod worker;
