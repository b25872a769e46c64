use std::rc::Rc;

/// Frames kept at each end of a deep trace
const KEPT_FRAMES: usize = 10;

/// An interpreted function that was active when an error was raised
#[derive(Debug, Clone, PartialEq)]
pub struct StackTraceFrame {
    pub(crate) source_name: Rc<str>,
    pub(crate) line: usize,
    pub(crate) instruction_index: usize,
}

impl StackTraceFrame {
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Zero when the function was loaded without line info.
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn instruction_index(&self) -> usize {
        self.instruction_index
    }
}

impl std::fmt::Display for StackTraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_name, self.line)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackTrace {
    frames: Vec<StackTraceFrame>,
    skipped: usize,
}

impl StackTrace {
    /// Frames are pushed innermost first. Deep traces keep their innermost and outermost frames.
    pub fn push_frame(&mut self, frame: StackTraceFrame) {
        if self.frames.len() == KEPT_FRAMES * 2 {
            self.frames.remove(KEPT_FRAMES);
            self.skipped += 1;
        }

        self.frames.push(frame);
    }

    /// The frame that raised the error
    pub fn innermost(&self) -> Option<&StackTraceFrame> {
        self.frames.first()
    }

    /// Innermost frame first.
    pub fn frames(&self) -> &[StackTraceFrame] {
        &self.frames
    }

    /// Frames dropped from the middle of the trace
    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }
}

impl std::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i == KEPT_FRAMES && self.skipped > 0 {
                write!(f, "\n  ...(skipping {} levels)", self.skipped)?;
            }

            write!(f, "\n  at {frame}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(line: usize) -> StackTraceFrame {
        StackTraceFrame {
            source_name: "deep.lua".into(),
            line,
            instruction_index: 0,
        }
    }

    #[test]
    fn deep_traces_keep_both_ends() {
        let mut trace = StackTrace::default();

        for line in 1..=30 {
            trace.push_frame(frame(line));
        }

        let lines: Vec<usize> = trace.frames().iter().map(|frame| frame.line()).collect();
        let expected: Vec<usize> = (1..=10).chain(21..=30).collect();

        assert_eq!(lines, expected);
        assert_eq!(trace.skipped_frames(), 10);
        assert_eq!(trace.innermost().map(|frame| frame.line()), Some(1));

        let text = trace.to_string();
        assert!(text.contains("\n  at deep.lua:10\n  ...(skipping 10 levels)\n  at deep.lua:21"));
    }
}
