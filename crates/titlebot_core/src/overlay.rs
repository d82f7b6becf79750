use anyhow::{Result, bail};

use crate::extract::TitleTable;

/// One hand-maintained fix for a known defect of the upstream archive page.
/// The list is data, not logic: new defects get a new entry, the interpreter
/// in [`apply_corrections`] never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub number: u32,
    pub action: CorrectionAction,
    /// Operator-facing justification, printed when the correction applies.
    pub note: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionAction {
    /// The archive page has no row for this issue at all.
    InsertMissing(&'static str),
    /// The scraped title is wrong (misnumbered, overwritten by a duplicate,
    /// truncated) and is replaced with the corrected literal.
    OverrideBroken(&'static str),
    /// A scraping defect produced an entry that should not exist.
    DeleteSpurious,
    /// The real title contains markup-significant characters; store the
    /// HTML-entity-escaped form so the Lua module renders safely.
    EscapeForTarget(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCorrection {
    pub number: u32,
    pub kind: &'static str,
    pub note: &'static str,
}

/// Known defects of archive.php, in application order. Entries are
/// independent; each carries a literal replacement.
pub fn standard_corrections() -> &'static [Correction] {
    const CORRECTIONS: &[Correction] = &[
        Correction {
            number: 570,
            action: CorrectionAction::InsertMissing("She Missed It All"),
            note: "row missing from archive.php",
        },
        Correction {
            number: 870,
            action: CorrectionAction::InsertMissing("Semi-Naker!"),
            note: "row missing from archive.php",
        },
        Correction {
            number: 878,
            action: CorrectionAction::InsertMissing("One Flew Over The Cuckoo's Nest"),
            note: "row present but title empty upstream",
        },
        Correction {
            number: 2770,
            action: CorrectionAction::InsertMissing("Plans Gone Awry"),
            note: "row present but title empty upstream",
        },
        Correction {
            number: 971,
            action: CorrectionAction::OverrideBroken(
                "Clean Freak by supar-webcomorx guest artiste Ryan Estrada",
            ),
            note: "misnumbered as 931 upstream",
        },
        Correction {
            number: 3901,
            action: CorrectionAction::OverrideBroken("Multiple Anatomy"),
            note: "title overwritten by the row for 3906",
        },
        Correction {
            number: 2155,
            action: CorrectionAction::OverrideBroken("Be More Obvious"),
            note: "duplicate row carries the title of 2153",
        },
        Correction {
            number: 2394,
            action: CorrectionAction::OverrideBroken("Greeting Gauntlet"),
            note: "duplicate row carries the title of 2393",
        },
        Correction {
            number: 0,
            action: CorrectionAction::DeleteSpurious,
            note: "duplicated row for 2308 links to view.php?comic=0",
        },
        Correction {
            number: 2680,
            action: CorrectionAction::EscapeForTarget("&gt;:|"),
            note: "angry emoticon >:|",
        },
        Correction {
            number: 3911,
            action: CorrectionAction::EscapeForTarget("&lt; body &gt;"),
            note: "literal < body > tag",
        },
    ];
    CORRECTIONS
}

/// Apply corrections in list order. Overlay entries always win over scraped
/// values. A correction that would introduce an empty title is a defect in
/// the correction list itself and fails the run.
pub fn apply_corrections(
    table: &mut TitleTable,
    corrections: &[Correction],
) -> Result<Vec<AppliedCorrection>> {
    let mut applied = Vec::with_capacity(corrections.len());
    for correction in corrections {
        let (kind, replacement) = match &correction.action {
            CorrectionAction::InsertMissing(title) => ("insert-missing", Some(*title)),
            CorrectionAction::OverrideBroken(title) => ("override-broken", Some(*title)),
            CorrectionAction::EscapeForTarget(title) => ("escape-for-target", Some(*title)),
            CorrectionAction::DeleteSpurious => ("delete-spurious", None),
        };
        match replacement {
            Some(title) => {
                if title.trim().is_empty() {
                    bail!(
                        "correction for issue {} would set an empty title",
                        correction.number
                    );
                }
                table.insert(correction.number, title.to_string());
            }
            None => {
                table.remove(&correction.number);
            }
        }
        applied.push(AppliedCorrection {
            number: correction.number,
            kind,
            note: correction.note,
        });
    }
    Ok(applied)
}
