//! Formatting for the `u8` bit sets.
//!
//! The sets are `bitflags` impls over plain newtypes, so they serialize as
//! their raw byte. Values read from configuration may therefore carry
//! unknown bits; use `from_bits` to reject them.

/// `Debug` by flag name, `Display` as the raw byte.
macro_rules! impl_mask_fmt {
    ($($name:ident),+ $(,)?) => {
        $(
            impl std::fmt::Debug for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    if self.is_empty() {
                        return write!(f, "{}(empty)", stringify!($name));
                    }
                    write!(f, "{}(", stringify!($name))?;
                    bitflags::parser::to_writer(self, &mut *f)?;
                    f.write_str(")")
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{:#04x}", self.bits())
                }
            }
        )+
    };
}
