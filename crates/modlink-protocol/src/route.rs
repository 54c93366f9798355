//! Destination expressions carried by routed events.
//!
//! Expressions are plain data here; evaluation against a registry lives in
//! `modlink-routing`.

use serde::{Deserialize, Serialize};

/// Recursive boolean filter tree resolving to a set of module ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RouteTargetExpression {
    And {
        all: Vec<RouteTargetExpression>,
    },
    Or {
        any: Vec<RouteTargetExpression>,
    },
    /// Glob over module ids.
    Glob {
        glob: String,
        #[serde(default, skip_serializing_if = "is_false")]
        inverted: bool,
    },
    Ids {
        ids: Vec<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        inverted: bool,
    },
    /// Plugin ids.
    Plugin {
        plugins: Vec<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        inverted: bool,
    },
    /// Registry instance keys (`name` or `name#index`).
    Instance {
        instances: Vec<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        inverted: bool,
    },
    /// Label selectors; all of them must hold.
    Label {
        selectors: Vec<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        inverted: bool,
    },
    /// Announced module names.
    Module {
        modules: Vec<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        inverted: bool,
    },
    /// Session source tags.
    Source {
        sources: Vec<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        inverted: bool,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl RouteTargetExpression {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Ids {
            ids: ids.into_iter().map(Into::into).collect(),
            inverted: false,
        }
    }

    pub fn glob(glob: impl Into<String>) -> Self {
        Self::Glob {
            glob: glob.into(),
            inverted: false,
        }
    }

    pub fn label(selector: impl Into<String>) -> Self {
        Self::Label {
            selectors: vec![selector.into()],
            inverted: false,
        }
    }

    /// The logical complement of this expression. Leaves flip `inverted`;
    /// combinators are rewritten with De Morgan's laws.
    pub fn invert(self) -> Self {
        match self {
            Self::And { all } => Self::Or {
                any: all.into_iter().map(Self::invert).collect(),
            },
            Self::Or { any } => Self::And {
                all: any.into_iter().map(Self::invert).collect(),
            },
            Self::Glob { glob, inverted } => Self::Glob {
                glob,
                inverted: !inverted,
            },
            Self::Ids { ids, inverted } => Self::Ids {
                ids,
                inverted: !inverted,
            },
            Self::Plugin { plugins, inverted } => Self::Plugin {
                plugins,
                inverted: !inverted,
            },
            Self::Instance {
                instances,
                inverted,
            } => Self::Instance {
                instances,
                inverted: !inverted,
            },
            Self::Label {
                selectors,
                inverted,
            } => Self::Label {
                selectors,
                inverted: !inverted,
            },
            Self::Module { modules, inverted } => Self::Module {
                modules,
                inverted: !inverted,
            },
            Self::Source { sources, inverted } => Self::Source {
                sources,
                inverted: !inverted,
            },
        }
    }
}

/// A destination entry: a bare module id or a full expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteDestination {
    Id(String),
    Expression(RouteTargetExpression),
}

impl RouteDestination {
    /// Bare ids are shorthand for a single-element `ids` leaf.
    pub fn to_expression(&self) -> RouteTargetExpression {
        match self {
            Self::Id(id) => RouteTargetExpression::ids([id.clone()]),
            Self::Expression(expression) => expression.clone(),
        }
    }
}

impl From<RouteTargetExpression> for RouteDestination {
    fn from(expression: RouteTargetExpression) -> Self {
        Self::Expression(expression)
    }
}

impl From<&str> for RouteDestination {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<RouteDestination>>,
    /// Deliver along the event's inherent target path without evaluating
    /// destinations.
    #[serde(default, skip_serializing_if = "is_false")]
    pub bypass: bool,
}

impl RouteConfig {
    pub fn to(destinations: Vec<RouteDestination>) -> Self {
        Self {
            destinations: Some(destinations),
            bypass: false,
        }
    }

    pub fn bypass() -> Self {
        Self {
            destinations: None,
            bypass: true,
        }
    }
}
