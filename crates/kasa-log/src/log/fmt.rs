use std::{
    io::Write,
    time::Instant,
};

use super::*;

/// Ordered segments a record is rendered from.
#[derive(Default, Clone)]
pub struct LogFmt {
    segments: Vec<SegmentSpec>,
}

/// What a single record carries into [`LogFmt::write`].
pub struct Record<'a> {
    pub target: &'a str,
    pub level: Level,
    pub args: core::fmt::Arguments<'a>,
    pub since: Instant,
}

impl LogFmt {

    fn clear(&mut self) {
        self.segments.clear();
    }

    /// `[LEVEL target] message` with the level colored.
    pub fn tagged(color: Color) -> Self {
        let mut fmt = Self::default();
        LogFmtBuilder::new(&mut fmt)
            .text("[", |spec| spec)
            .level(|spec| spec.with_color_spec(|c| { c.set_fg(Some(color)).set_bold(true); }))
            .text(" ", |spec| spec)
            .target(|spec| spec.with_color_spec(|c| { c.set_dimmed(true); }))
            .text("] ", |spec| spec)
            .message(|spec| spec);
        fmt
    }

    /// `+elapsed [LEVEL target] message`, for tracing allocation traffic over time.
    pub fn timed(color: Color) -> Self {
        let mut fmt = Self::tagged(color);
        fmt.segments.insert(0, SegmentSpec::Text(CompactString::new(" "), LogSpec::default()));
        fmt.segments.insert(0, SegmentSpec::Elapsed(LogSpec::default().with_color_spec(|c| { c.set_dimmed(true); })));
        fmt
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[inline(always)]
    pub fn segments(&self) -> &[SegmentSpec] {
        &self.segments
    }

    /// Renders `record` followed by a newline.
    pub fn write<W: WriteColor>(&self, out: &mut W, record: &Record<'_>) -> std::io::Result<()> {
        for segment in &self.segments {
            match segment {
                SegmentSpec::Message(spec) => spec.styled(out, |out| write!(out, "{}", record.args))?,
                SegmentSpec::Target(spec) => spec.styled(out, |out| out.write_all(record.target.as_bytes()))?,
                SegmentSpec::Level(spec) => spec.styled(out, |out| out.write_all(record.level.name().as_bytes()))?,
                SegmentSpec::Elapsed(spec) => {
                    let elapsed = record.since.elapsed();
                    spec.styled(out, |out| write!(out, "+{}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis()))?
                },
                SegmentSpec::Text(text, spec) => spec.styled(out, |out| out.write_all(text.as_bytes()))?,
            }
        }
        out.write_all(b"\n")
    }
}

impl<'a> IntoIterator for &'a LogFmt {

    type Item = &'a SegmentSpec;
    type IntoIter = core::slice::Iter<'a, SegmentSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

#[derive(Default, Clone)]
pub struct LogSpec {
    pub color_spec: Option<ColorSpec>,
}

impl LogSpec {

    #[inline(always)]
    pub fn with_color_spec(mut self, mut f: impl FnMut(&mut ColorSpec)) -> Self {
        let color_spec = self.color_spec.insert(ColorSpec::new());
        f(color_spec);
        self
    }

    fn styled<W: WriteColor>(
        &self,
        out: &mut W,
        f: impl FnOnce(&mut W) -> std::io::Result<()>,
    ) -> std::io::Result<()>
    {
        let Some(color_spec) = &self.color_spec else {
            return f(out)
        };
        out.set_color(color_spec)?;
        f(out)?;
        out.reset()
    }
}

#[derive(Clone)]
pub enum SegmentSpec {
    Message(LogSpec),
    Target(LogSpec),
    Level(LogSpec),
    /// Time since the logger was initialized.
    Elapsed(LogSpec),
    Text(CompactString, LogSpec),
}

pub struct LogFmtBuilder<'a> {
    fmt: &'a mut LogFmt,
}

impl<'a> LogFmtBuilder<'a> {

    #[inline(always)]
    pub fn new(fmt: &'a mut LogFmt) -> Self {
        fmt.clear();
        Self {
            fmt,
        }
    }

    #[inline(always)]
    fn push(&mut self, segment: SegmentSpec) -> &mut Self {
        self.fmt.segments.push(segment);
        self
    }

    #[inline(always)]
    pub fn message(&mut self, f: impl FnOnce(LogSpec) -> LogSpec) -> &mut Self {
        self.push(SegmentSpec::Message(f(Default::default())))
    }

    #[inline(always)]
    pub fn target(&mut self, f: impl FnOnce(LogSpec) -> LogSpec) -> &mut Self {
        self.push(SegmentSpec::Target(f(Default::default())))
    }

    #[inline(always)]
    pub fn level(&mut self, f: impl FnOnce(LogSpec) -> LogSpec) -> &mut Self {
        self.push(SegmentSpec::Level(f(Default::default())))
    }

    #[inline(always)]
    pub fn elapsed(&mut self, f: impl FnOnce(LogSpec) -> LogSpec) -> &mut Self {
        self.push(SegmentSpec::Elapsed(f(Default::default())))
    }

    #[inline(always)]
    pub fn text(&mut self, text: &str, f: impl FnOnce(LogSpec) -> LogSpec) -> &mut Self {
        self.push(SegmentSpec::Text(CompactString::new(text), f(Default::default())))
    }
}
