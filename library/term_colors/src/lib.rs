//! term_colors is a collection of convenience functions for coloring terminal output.
//!
//! The executor logs a LOT of identifiers (job ids, pod names, queue names) and it
//! is dramatically easier on the eyes when they are painted consistently. The loose
//! convention throughout the codebase is:
//!
//! * [cyan] for identifiers (job ids, pod names, task names).
//! * [green] for healthy states and [red] for unhealthy ones.
//! * [orange] for durations and other measurements.
//! * [yellow] for things that are concerning but not yet wrong.

use ansi_term::ANSIGenericString;
use std::borrow::Cow;

macro_rules! painter {
    ($name:ident, $color:expr) => {
        pub fn $name<'a, I, S: 'a + ToOwned + ?Sized>(input: I) -> ANSIGenericString<'a, S>
        where
            I: Into<Cow<'a, S>>,
            <S as ToOwned>::Owned: std::fmt::Debug,
        {
            $color.paint(input)
        }
    };
}

painter!(cyan, ansi_term::Color::Cyan);
painter!(green, ansi_term::Color::Green);
painter!(red, ansi_term::Color::Red);
painter!(yellow, ansi_term::Color::Yellow);
painter!(orange, ansi_term::Color::RGB(243, 113, 33));

pub fn bold<'a, I, S: 'a + ToOwned + ?Sized>(input: I) -> ANSIGenericString<'a, S>
where
    I: Into<Cow<'a, S>>,
    <S as ToOwned>::Owned: std::fmt::Debug,
{
    ansi_term::Style::new().bold().paint(input)
}
