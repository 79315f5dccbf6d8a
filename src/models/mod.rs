mod outcome;
mod policy;
mod report;
mod response;

pub use outcome::*;
pub use policy::*;
pub use report::*;
pub use response::*;
