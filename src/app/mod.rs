pub mod context;
pub mod run;

pub use run::run;
