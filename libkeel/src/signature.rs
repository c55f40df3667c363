use crate::error::{KeelGenericError, KeelResult};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[derive(PartialEq, Clone, Debug, Hash, Ord, PartialOrd, Eq, Copy)]
pub struct KeelEpochTime(i64);

impl KeelEpochTime {
    pub fn new(i: i64) -> Self {
        Self(i)
    }

    pub fn as_secs(self) -> i64 {
        self.0
    }
}

/// timezone offset in minutes
#[derive(PartialEq, Clone, Debug, Hash, Ord, PartialOrd, Eq, Copy)]
pub struct KeelTimeZoneOffset(i32);

impl KeelTimeZoneOffset {
    pub fn new(offset: i32) -> Self {
        Self(offset)
    }
}

#[derive(PartialEq, Clone, Debug, PartialOrd, Eq, Ord, Hash, Copy)]
pub struct KeelTime {
    pub(crate) time: KeelEpochTime,
    pub(crate) offset: KeelTimeZoneOffset,
}

impl KeelTime {
    pub fn new(time: KeelEpochTime, offset: KeelTimeZoneOffset) -> Self {
        Self { time, offset }
    }

    pub fn epoch_secs(self) -> i64 {
        self.time.as_secs()
    }
}

#[derive(PartialEq, Clone, Debug)]
pub struct KeelSignature {
    pub name: String,
    pub email: String,
    pub time: KeelTime,
}

impl FromStr for KeelTimeZoneOffset {
    type Err = KeelGenericError;

    // format: (+|-)0200
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(s.len() >= 5, "invalid timezone format `{}`", s);
        let sign = match &s[0..1] {
            "+" => 1,
            "-" => -1,
            _ => bail!("invalid timezone format `{}`", s),
        };
        let hours: i32 = s[1..3].parse()?;
        let minutes: i32 = s[3..5].parse()?;
        let offset = sign * (minutes + hours * 60);
        Ok(Self(offset))
    }
}

impl FromStr for KeelEpochTime {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // overflowing or unparseable dates clamp to zero rather than aborting
        // the parse; the integrity checker reports them separately
        Ok(Self(s.parse().unwrap_or(0)))
    }
}

impl FromStr for KeelTime {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut splits = s.split_ascii_whitespace();
        let time = splits.next().ok_or_else(|| anyhow!("missing timestamp"))?.parse()?;
        let offset = splits.next().ok_or_else(|| anyhow!("missing timezone"))?.parse()?;
        Ok(Self { time, offset })
    }
}

impl FromStr for KeelSignature {
    type Err = KeelGenericError;

    // A U Thor <author@example.com> 1616061862 +1300
    fn from_str(s: &str) -> KeelResult<Self> {
        let email_start = s.find('<').ok_or_else(|| anyhow!("missing email in signature"))?;
        let email_end = s.find('>').ok_or_else(|| anyhow!("missing email in signature"))?;
        ensure!(email_start < email_end, "malformed email in signature");

        let name = s[..email_start].trim_end().to_owned();
        let email = s[email_start + 1..email_end].to_owned();
        let time = s[email_end + 1..].trim_start().parse()?;
        Ok(Self { name, email, time })
    }
}

impl Display for KeelTimeZoneOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (sign, offset) = if self.0 >= 0 { ('+', self.0) } else { ('-', -self.0) };
        write!(f, "{}{:02}{:02}", sign, offset / 60, offset % 60)
    }
}

impl Display for KeelTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.time.0, self.offset)
    }
}

impl Display for KeelSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.time)
    }
}
