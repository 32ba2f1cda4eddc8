/// Generates `as_str`, `parse_str` and `Display` for a string-backed enum.
///
/// The first string of each variant is canonical (what `as_str` and `Display`
/// produce); any further strings are accepted aliases when parsing.
///
/// ```ignore
/// enum_str! {
///     impl LifecycleState {
///         pub fn as_str(&self) -> &'static str;
///         pub fn parse_str(raw: &str) -> Option<Self>;
///         variants {
///             Created => ["created"],
///             Running => ["running", "started"],
///         }
///     }
/// }
/// ```
#[macro_export]
macro_rules! enum_str {
    (
        impl $name:ident {
            $as_vis:vis fn as_str(&self) -> &'static str;
            $parse_vis:vis fn parse_str($raw:ident : &str) -> Option<Self>;
            variants {
                $($variant:ident => [$first:expr $(, $alias:expr)*]),+ $(,)?
            }
        }
    ) => {
        impl $name {
            $as_vis fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $first,)+
                }
            }

            #[allow(dead_code)]
            $parse_vis fn parse_str($raw: &str) -> Option<Self> {
                match $raw {
                    $($first $(| $alias)* => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
