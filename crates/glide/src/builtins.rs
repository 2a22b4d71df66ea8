use std::str::FromStr;

use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Enumerates every host-native built-in.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and
/// `Into<&'static str>` implementations. Host symbols carry
/// double-underscore names; the bootstrap source maps them to the public
/// vocabulary (`print`, `range`, ...). `delete` is also callable directly
/// because it operates on raw identifier arguments in the caller's scope,
/// which a source-level wrapper cannot see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
pub(crate) enum Builtin {
    #[strum(serialize = "__exit__")]
    Exit,
    #[strum(serialize = "__error__")]
    Error,
    #[strum(serialize = "__range__")]
    Range,
    #[strum(serialize = "__print__")]
    Print,
    #[strum(serialize = "__delete__")]
    Delete,
    #[strum(serialize = "__time__")]
    Time,
    #[strum(serialize = "__import__")]
    Import,
    #[strum(serialize = "__read__")]
    Read,
    #[strum(serialize = "__write__")]
    Write,
    #[strum(serialize = "__append__")]
    Append,
    #[strum(serialize = "__to_int__")]
    ToInt,
    #[strum(serialize = "__to_float__")]
    ToFloat,
    #[strum(serialize = "__to_string__")]
    ToString,
    #[strum(serialize = "__type__")]
    TypeOf,
    #[strum(serialize = "__shape__")]
    Shape,
}

impl Builtin {
    /// Resolves a call-site name to a host built-in.
    ///
    /// A few public names resolve here instead of through the bootstrap:
    /// `delete` needs the caller's raw identifiers, `import` must see its
    /// literal path at check time, and `type` is a reserved type-name
    /// identifier a wrapper could not be bound to.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "delete" => Some(Self::Delete),
            "type" | "typeof" => Some(Self::TypeOf),
            "import" => Some(Self::Import),
            _ => Self::from_str(name).ok(),
        }
    }

    /// Every name the host injects, for the import-exclusion list.
    pub fn host_names() -> Vec<String> {
        let mut names: Vec<String> = Self::iter().map(|b| b.to_string()).collect();
        for direct in ["delete", "type", "typeof", "import"] {
            names.push(direct.to_owned());
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_names_resolve() {
        assert_eq!(Builtin::from_name("__print__"), Some(Builtin::Print));
        assert_eq!(Builtin::from_name("__to_int__"), Some(Builtin::ToInt));
        assert_eq!(Builtin::from_name("delete"), Some(Builtin::Delete));
        assert_eq!(Builtin::from_name("typeof"), Some(Builtin::TypeOf));
        assert_eq!(Builtin::from_name("import"), Some(Builtin::Import));
        assert_eq!(Builtin::from_name("print"), None);
    }

    #[test]
    fn display_is_the_host_symbol() {
        assert_eq!(Builtin::Print.to_string(), "__print__");
        assert!(Builtin::host_names().contains(&"__shape__".to_owned()));
    }
}
