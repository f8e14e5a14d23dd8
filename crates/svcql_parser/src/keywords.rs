/// Try to get a keyword from a string, ignoring string casing.
pub fn keyword_from_str(s: &str) -> Option<Keyword> {
    let s = unicase::Ascii::new(s);
    let idx = match KEYWORD_STRINGS.binary_search(&s) {
        Ok(idx) => idx,
        Err(_) => return None,
    };
    Some(ALL_KEYWORDS[idx])
}

/// Generate an enum of keywords.
///
/// Keywords must be provided in sorted order.
macro_rules! define_keywords {
    ($($ident:ident),*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Keyword {
            $($ident),*
        }

        pub const ALL_KEYWORDS: &'static [Keyword] = &[
            $(Keyword::$ident),*
        ];

        pub const KEYWORD_STRINGS: &'static [unicase::Ascii<&'static str>] = &[
            $(unicase::Ascii::new(stringify!($ident)),)*
        ];
    };
}

#[rustfmt::skip]
define_keywords!(
    ALL,
    AND,
    AS,
    ASC,
    BY,
    CASE,
    DESC,
    DISTINCT,
    ELSE,
    END,
    FALSE,
    FROM,
    GROUP,
    HAVING,
    IN,
    IS,
    LIKE,
    LIMIT,
    NOT,
    NULL,
    OR,
    ORDER,
    SELECT,
    THEN,
    TRUE,
    WHEN,
    WHERE
);

impl Keyword {
    /// Keywords that terminate a select list item and so can never be used as
    /// an implicit alias.
    pub const RESERVED_FOR_ALIAS: &'static [Keyword] = &[
        Keyword::FROM,
        Keyword::WHERE,
        Keyword::GROUP,
        Keyword::HAVING,
        Keyword::ORDER,
        Keyword::LIMIT,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_sorted() {
        let mut sorted = KEYWORD_STRINGS.to_vec();
        sorted.sort();
        assert_eq!(KEYWORD_STRINGS, sorted.as_slice());
    }

    #[test]
    fn keyword_lookup_ignores_case() {
        assert_eq!(Some(Keyword::SELECT), keyword_from_str("select"));
        assert_eq!(Some(Keyword::HAVING), keyword_from_str("HaViNg"));
        assert_eq!(None, keyword_from_str("parameter"));
    }
}
