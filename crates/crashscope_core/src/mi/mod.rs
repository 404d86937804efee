//! GDB Machine Interface codec.
//!
//! Grammar handled by the parser:
//!
//! ```text
//! line    := [token] ("^" | "*" | "+" | "=") class ("," result)*
//!          | ("~" | "@" | "&") c-string
//!          | "(gdb)"
//! result  := variable "=" value
//! value   := c-string | "{" [result ("," result)*] "}"
//!          | "[" [value ("," value)* | result ("," result)*] "]"
//! ```

mod encode;
mod parser;
mod record;
mod value;

pub use encode::{encode, quote_arg, MiCommand};
pub use parser::{parse_line, ProtocolParseError};
pub use record::{AsyncRecord, MiResult, Record, ResultClass};
pub use value::MiValue;
