//! Operator-facing device operations.
//!
//! Callers address a device by the user who owns it, never by MAC: the user's
//! `associatedUser` is joined against each device's `userAssociated`.

pub mod update;
