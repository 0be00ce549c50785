//! The three pipeline stages.
//!
//! Each stage is written against `Read`/`Write` (or plain pipe files) and
//! knows nothing about processes; `core::session` decides where they run.
//!
//! ```text
//! stage/
//! ├── input.rs      - keystrokes, echo, line buffer
//! ├── translate.rs  - remap, line kill, backspace
//! └── output.rs     - sole writer to the display
//! ```

pub mod input;
pub mod output;
pub mod translate;
