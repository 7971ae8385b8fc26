use std::fmt;

/// Display power as decided by the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Active,
    Standby,
}

impl PowerState {
    pub fn is_standby(self) -> bool {
        self == Self::Standby
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Standby => "standby",
        })
    }
}

/// Everything that can wake the slideshow out of its interval wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideshowEvent {
    Next,
    Prev,
    NextAlbum,
    PrevAlbum,
    ClearCache,
    MemoryForget,
    /// A setting that affects rendering or selection changed.
    SettingsChanged,
    Power(PowerState),
    /// Something became available to show (keywords, a linked provider).
    Trigger,
}

impl SlideshowEvent {
    /// Parses the `/control/<cmd>` vocabulary.
    pub fn from_control(cmd: &str) -> Option<Self> {
        Some(match cmd {
            "next" => Self::Next,
            "prev" => Self::Prev,
            "nextAlbum" => Self::NextAlbum,
            "prevAlbum" => Self::PrevAlbum,
            "clearCache" => Self::ClearCache,
            "memoryForget" => Self::MemoryForget,
            _ => return None,
        })
    }
}

/// Named sources that vote on display power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VoteSource {
    Schedule,
    Ambient,
    Motion,
    Manual,
}

impl VoteSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Ambient => "ambient",
            Self::Motion => "motion",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for VoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_vocabulary() {
        assert_eq!(SlideshowEvent::from_control("nextAlbum"), Some(SlideshowEvent::NextAlbum));
        assert_eq!(SlideshowEvent::from_control("memoryForget"), Some(SlideshowEvent::MemoryForget));
        assert_eq!(SlideshowEvent::from_control("settings"), None);
    }
}
