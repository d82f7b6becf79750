//! Core logic for the comic-title wiki bot: scrape the archive listing,
//! reconcile known defects, render the Lua titles module, and publish it.

pub mod archive;
pub mod config;
pub mod extract;
pub mod lua_table;
pub mod overlay;
pub mod publish;
pub mod runner;
