//! Small shared helpers

pub mod circbuf;
