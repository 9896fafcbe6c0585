//! Opening positions handed out one game at a time.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Where a game starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Opening {
    /// The variant's standard initial position.
    #[default]
    StartPosition,
    /// A position given as FEN.
    Fen(String),
}

impl Opening {
    /// The FEN, if the game does not start from the initial position.
    pub fn fen(&self) -> Option<&str> {
        match self {
            Opening::StartPosition => None,
            Opening::Fen(fen) => Some(fen),
        }
    }

    fn from_line(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            Opening::StartPosition
        } else {
            Opening::Fen(line.to_string())
        }
    }
}

enum Source {
    /// Every game starts from the initial position.
    Unlimited,
    Reader(Box<dyn BufRead + Send>),
    Lines(VecDeque<String>),
}

/// Yields openings in order until the source is used up.
pub struct OpeningFeeder {
    source: Source,
    served: u64,
    exhausted: bool,
}

impl OpeningFeeder {
    /// A feeder that never runs out and always yields the start position.
    pub fn unlimited() -> Self {
        Self::with_source(Source::Unlimited)
    }

    /// Opens a file with one FEN per line.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn from_reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        Self::with_source(Source::Reader(Box::new(reader)))
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_source(Source::Lines(lines.into_iter().map(Into::into).collect()))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            served: 0,
            exhausted: false,
        }
    }

    /// Number of openings handed out so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// The next opening, or `None` once the source is used up.
    ///
    /// A blank line means the start position; end of input is exhaustion,
    /// and so is a read error, which is logged.
    pub fn next_opening(&mut self) -> Option<Opening> {
        if self.exhausted {
            return None;
        }
        let opening = match &mut self.source {
            Source::Unlimited => Some(Opening::StartPosition),
            Source::Lines(lines) => lines.pop_front().map(|l| Opening::from_line(&l)),
            Source::Reader(reader) => {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => None,
                    Ok(_) => Some(Opening::from_line(&line)),
                    Err(e) => {
                        tracing::error!("Failed to read opening: {}", e);
                        None
                    }
                }
            }
        };
        match opening {
            Some(_) => self.served += 1,
            None => {
                self.exhausted = true;
                tracing::info!("Used all openings ({} served)", self.served);
            }
        }
        opening
    }
}
