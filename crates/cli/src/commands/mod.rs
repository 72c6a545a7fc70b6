pub mod call;
pub mod demo;
pub mod serve;
pub mod status;
