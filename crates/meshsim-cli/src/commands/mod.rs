pub mod run;
pub mod sweep;
pub mod validate;
