//! The plugin side of crossbar: the stdout protocol plugins print, and the file name convention
//! (`<name>.<interval><unit>.<ext>`) they are discovered by.

pub mod error;
pub mod filename;
pub mod format;
pub mod model;
pub mod parser;

pub use error::{IntervalError, ParseError};
pub use model::{Attributes, MenuItem, MenuLine, RenderModel, Status};
pub use parser::{parse, parse_str};
