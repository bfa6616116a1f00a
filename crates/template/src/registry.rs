use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of templates the runtime knows how to dispatch. "Does handler H
/// support template T" is a capability-table lookup keyed by this id; nothing
/// is reflected over at request time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateId {
    Report,
    Check,
    ListEntry,
    Quota,
    AttrGen,
}

/// What a template's handler method does for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variety {
    Report,
    Check,
    Quota,
    AttributeGen,
}

impl TemplateId {
    pub const ALL: [TemplateId; 5] = [
        TemplateId::Report,
        TemplateId::Check,
        TemplateId::ListEntry,
        TemplateId::Quota,
        TemplateId::AttrGen,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TemplateId::Report => "report",
            TemplateId::Check => "check",
            TemplateId::ListEntry => "listentry",
            TemplateId::Quota => "quota",
            TemplateId::AttrGen => "attrgen",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }

    pub fn variety(self) -> Variety {
        match self {
            TemplateId::Report => Variety::Report,
            TemplateId::Check | TemplateId::ListEntry => Variety::Check,
            TemplateId::Quota => Variety::Quota,
            TemplateId::AttrGen => Variety::AttributeGen,
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
