pub mod analysis;
pub mod audit;
pub mod consent;
pub mod rights;
pub mod session;
pub mod user;

pub use analysis::*;
pub use audit::*;
pub use consent::*;
pub use rights::*;
pub use session::*;
pub use user::*;
