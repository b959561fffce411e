pub mod common;
pub mod dump;
pub mod imports;
pub mod info;
pub mod resolve;
pub mod sections;
