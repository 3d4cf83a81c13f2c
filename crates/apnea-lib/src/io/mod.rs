pub mod features;
pub mod mat;
pub mod wfdb;
