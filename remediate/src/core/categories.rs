//! Declarative table of the tooling configuration categories the audit covers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a category's configuration is read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// Plain JSON document.
    Json,
    /// CommonJS module evaluated with `node`; rewritten as JSON at `write_path`.
    JsModule,
    /// One executable script per hook under a directory.
    HookScripts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigCategory {
    Eslint,
    Prettier,
    Typescript,
    Jest,
    Husky,
}

/// Where a category lives and how to parse it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySpec {
    pub category: ConfigCategory,
    /// Candidate read locations with their format, first existing one wins.
    pub candidates: &'static [(&'static str, ConfigFormat)],
    /// Where proposed updates are written.
    pub write_path: &'static str,
}

/// Hook names in the husky config object mapped to their script file.
pub const HUSKY_HOOKS: &[(&str, &str)] = &[
    ("preCommit", ".husky/pre-commit"),
    ("prePush", ".husky/pre-push"),
    ("commitMsg", ".husky/commit-msg"),
];

const TABLE: &[CategorySpec] = &[
    CategorySpec {
        category: ConfigCategory::Eslint,
        candidates: &[
            (".eslintrc.js", ConfigFormat::JsModule),
            (".eslintrc.json", ConfigFormat::Json),
        ],
        write_path: ".eslintrc.json",
    },
    CategorySpec {
        category: ConfigCategory::Prettier,
        candidates: &[
            (".prettierrc", ConfigFormat::Json),
            (".prettierrc.json", ConfigFormat::Json),
        ],
        write_path: ".prettierrc",
    },
    CategorySpec {
        category: ConfigCategory::Typescript,
        candidates: &[("tsconfig.json", ConfigFormat::Json)],
        write_path: "tsconfig.json",
    },
    CategorySpec {
        category: ConfigCategory::Jest,
        candidates: &[
            ("jest.config.js", ConfigFormat::JsModule),
            ("jest.config.json", ConfigFormat::Json),
        ],
        write_path: "jest.config.json",
    },
    CategorySpec {
        category: ConfigCategory::Husky,
        candidates: &[(".husky", ConfigFormat::HookScripts)],
        write_path: ".husky",
    },
];

impl ConfigCategory {
    pub const ALL: [ConfigCategory; 5] = [
        ConfigCategory::Eslint,
        ConfigCategory::Prettier,
        ConfigCategory::Typescript,
        ConfigCategory::Jest,
        ConfigCategory::Husky,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigCategory::Eslint => "eslint",
            ConfigCategory::Prettier => "prettier",
            ConfigCategory::Typescript => "typescript",
            ConfigCategory::Jest => "jest",
            ConfigCategory::Husky => "husky",
        }
    }

    pub fn spec(self) -> &'static CategorySpec {
        // TABLE holds one entry per variant in declaration order.
        &TABLE[self as usize]
    }
}

impl fmt::Display for ConfigCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown config type '{s}' (expected one of: {})",
                    ConfigCategory::ALL.map(ConfigCategory::as_str).join(", ")
                )
            })
    }
}
