// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! This crate defines [structs for the on-wire NT heap layouts](format/index.html) as well as
//! [the target-access trait](traits/index.html) used by related crates.
//!
//! You probably don't want to use this crate directly, the [heapwalk][heapwalk] crate provides
//! the actual functionality of walking a target's heaps using the definitions in this crate.

pub mod format;
pub mod traits;
