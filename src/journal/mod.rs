//! Component B: the journal (spec §4.B). `entry` is the wire format,
//! `reservation` is the in-memory ordering primitive transactions use
//! to obtain a commit seq, `ring` is the on-device ring buffer that
//! actually persists sealed entries, and `replay` turns whatever
//! survived a crash into an apply list plus a blacklist.

pub mod entry;
pub mod replay;
pub mod reservation;
pub mod ring;
