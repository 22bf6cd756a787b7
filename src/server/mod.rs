// src/server/mod.rs
pub mod locale;
pub mod page;
pub mod session;

pub use locale::{Locale, LocalePolicy};
pub use page::{BuiltinPages, PageRenderer};
pub use session::{KeyCallback, SessionOptions, SessionServer};
