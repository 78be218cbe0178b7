pub mod compress;
pub mod file;
pub mod sha;
