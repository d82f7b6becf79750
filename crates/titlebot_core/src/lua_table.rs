use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::Regex;

use crate::extract::TitleTable;

const MODULE_HEADER: &str = "local titles = {";
const MODULE_FOOTER: &str = "}\nreturn titles\n-- [[Category:Lua Modules]]\n";

/// Serialize the table as the `Module:.../titles` Lua data module.
/// Newest issue first so manual review of the page diff starts at the top.
pub fn render_titles_module(table: &TitleTable) -> String {
    let mut output = String::with_capacity(table.len() * 32 + 64);
    output.push_str(MODULE_HEADER);
    output.push('\n');
    for (number, title) in table.iter().rev() {
        output.push_str(&format!("[{}]=\"{}\",\n", number, escape_title(title)));
    }
    output.push_str(MODULE_FOOTER);
    output
}

fn escape_title(title: &str) -> String {
    title.replace('\\', "\\\\").replace('"', "\\\"")
}

static BRACKETED_KEY: OnceLock<Regex> = OnceLock::new();

fn bracketed_key() -> &'static Regex {
    BRACKETED_KEY
        .get_or_init(|| Regex::new(r"\[([0-9]{1,6})\]").expect("bracketed key pattern is valid"))
}

/// Highest bracketed numeric key in a serialized table text. Works on both
/// the freshly rendered module and the currently published page text.
pub fn last_issue_in(text: &str) -> Option<u32> {
    bracketed_key()
        .captures_iter(text)
        .filter_map(|captures| captures[1].parse::<u32>().ok())
        .max()
}

/// Parse the rendered text as Lua. A syntax error here means the serializer
/// produced a module the wiki templates could not load.
pub fn validate_module(text: &str) -> Result<()> {
    if let Err(errors) = full_moon::parse(text) {
        let details = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        bail!("generated module is not valid Lua: {details}");
    }
    Ok(())
}
