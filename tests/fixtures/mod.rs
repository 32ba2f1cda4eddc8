#![allow(dead_code)]

pub mod repl_rig;
