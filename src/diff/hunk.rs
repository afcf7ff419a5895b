//! Hunk headers and bodies, for both two-way and combined diffs.

use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, one_of, space1},
    combinator::{map_res, opt},
    multi::separated_list1,
    sequence::preceded,
};

use super::ParseError;

/// Which side of the diff a location describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationOp {
    /// `-a,b`: a parent's version
    Old,
    /// `+a,b`: the commit's version
    New,
}

/// One `-a,b` or `+a,b` token of a hunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkLocation {
    pub op: LocationOp,
    /// 1-based first line, or the line *after which* the hunk sits when `count == 0`
    pub offset: usize,
    pub count: usize,
}

impl HunkLocation {
    /// 0-based index of the first line the hunk body walks over.
    pub fn start_index(&self) -> usize {
        if self.count == 0 {
            self.offset
        } else {
            self.offset.saturating_sub(1)
        }
    }
}

/// One line of a hunk body, split into its prefix columns and content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLine<'a> {
    /// One of `' '`, `'-'`, `'+'` per parent
    pub columns: &'a [u8],
    pub content: &'a [u8],
}

impl BodyLine<'_> {
    /// Column for the given parent.
    pub fn column(&self, parent: usize) -> u8 {
        self.columns.get(parent).copied().unwrap_or(b' ')
    }

    /// The line is absent from the commit's version (some parent had it).
    pub fn is_removal(&self) -> bool {
        self.columns.contains(&b'-')
    }

    /// The line exists in the given parent's version.
    pub fn in_parent(&self, parent: usize) -> bool {
        match self.column(parent) {
            b'-' => true,
            b' ' => !self.is_removal(),
            _ => false,
        }
    }
}

/// A contiguous changed region, located in every parent and in the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// One `Old` location per parent, followed by the `New` location
    pub locations: Vec<HunkLocation>,
    /// Raw body lines, each terminated by `\n`
    pub body: Vec<u8>,
}

impl Hunk {
    /// Parse a header line into a hunk with an empty body.
    pub fn parse_header(line: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedHunkHeader {
            line: line.to_string(),
        };

        let (rest, (marker, locations)) = header(line).map_err(|_| malformed())?;
        if !rest.is_empty() && !rest.starts_with(' ') {
            return Err(malformed());
        }
        let parents = marker.checked_sub(1).filter(|n| *n > 0).ok_or_else(malformed)?;

        let well_formed = locations.len() == parents + 1
            && locations[..parents]
                .iter()
                .all(|l| l.op == LocationOp::Old)
            && locations[parents].op == LocationOp::New;
        if !well_formed {
            return Err(malformed());
        }

        Ok(Hunk {
            locations,
            body: Vec::new(),
        })
    }

    pub fn parent_count(&self) -> usize {
        self.locations.len().saturating_sub(1)
    }

    /// Location of this hunk in the given parent's version.
    pub fn old_location(&self, parent: usize) -> Option<&HunkLocation> {
        self.locations[..self.parent_count()].get(parent)
    }

    /// Location of this hunk in the commit's version.
    pub fn new_location(&self) -> Option<&HunkLocation> {
        self.locations.last()
    }

    /// Append one raw body line (without its newline), checking its prefix columns.
    pub fn push_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let parents = self.parent_count();
        let valid = line.first() == Some(&b'\\')
            || (line.len() >= parents
                && line[..parents]
                    .iter()
                    .all(|c| matches!(c, b' ' | b'-' | b'+')));
        if !valid {
            return Err(ParseError::MalformedHunkLine {
                line: String::from_utf8_lossy(line).into_owned(),
            });
        }
        self.body.extend_from_slice(line);
        self.body.push(b'\n');
        Ok(())
    }

    /// Body lines in order, skipping `\ No newline at end of file` markers.
    pub fn lines(&self) -> impl Iterator<Item = BodyLine<'_>> {
        let parents = self.parent_count();
        self.body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty() && line[0] != b'\\')
            .map(move |line| {
                let (columns, content) = line.split_at(parents.min(line.len()));
                BodyLine { columns, content }
            })
    }

    /// Body as text, for error reports.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn number(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |digits: &str| digits.parse::<usize>()).parse(input)
}

fn location(input: &str) -> IResult<&str, HunkLocation> {
    let (input, op) = one_of("-+").parse(input)?;
    let (input, offset) = number(input)?;
    let (input, count) = opt(preceded(char(','), number)).parse(input)?;
    let op = if op == '-' {
        LocationOp::Old
    } else {
        LocationOp::New
    };
    Ok((
        input,
        HunkLocation {
            op,
            offset,
            count: count.unwrap_or(1),
        },
    ))
}

/// `@@@ -a,b -c,d +e,f @@@ section`: marker length and the locations
fn header(input: &str) -> IResult<&str, (usize, Vec<HunkLocation>)> {
    let (input, marker) = take_while1(|c| c == '@').parse(input)?;
    let (input, locations) = preceded(space1, separated_list1(space1, location)).parse(input)?;
    let (input, _) = preceded(space1, tag(marker)).parse(input)?;
    Ok((input, (marker.len(), locations)))
}
