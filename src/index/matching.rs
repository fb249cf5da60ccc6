//! Attribute matching for C-FIND style filters

use dicom_core::Tag;
use dicom_dictionary_std::tags;

use crate::index::SeriesRecord;

/// Record attributes a filter can address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    PatientId,
    PatientName,
    StudyUid,
    StudyDate,
    StudyDescription,
    SeriesUid,
    SeriesDescription,
    Modality,
    SeriesNumber,
}

impl Attribute {
    pub fn from_tag(tag: Tag) -> Option<Self> {
        let attribute = match tag {
            tags::PATIENT_ID => Attribute::PatientId,
            tags::PATIENT_NAME => Attribute::PatientName,
            tags::STUDY_INSTANCE_UID => Attribute::StudyUid,
            tags::STUDY_DATE => Attribute::StudyDate,
            tags::STUDY_DESCRIPTION => Attribute::StudyDescription,
            tags::SERIES_INSTANCE_UID => Attribute::SeriesUid,
            tags::SERIES_DESCRIPTION => Attribute::SeriesDescription,
            tags::MODALITY | tags::MODALITIES_IN_STUDY => Attribute::Modality,
            tags::SERIES_NUMBER => Attribute::SeriesNumber,
            _ => return None,
        };
        Some(attribute)
    }

    pub fn value(self, record: &SeriesRecord) -> String {
        match self {
            Attribute::PatientId => record.patient_id.clone(),
            Attribute::PatientName => record.patient_name.clone(),
            Attribute::StudyUid => record.study_uid.clone(),
            Attribute::StudyDate => record.study_date.clone(),
            Attribute::StudyDescription => record.study_description.clone(),
            Attribute::SeriesUid => record.series_uid.clone(),
            Attribute::SeriesDescription => record.series_description.clone(),
            Attribute::Modality => record.modality.clone(),
            Attribute::SeriesNumber => record
                .series_number
                .map(|n| n.to_string())
                .unwrap_or_default(),
        }
    }

    fn is_date(self) -> bool {
        matches!(self, Attribute::StudyDate)
    }

    /// Attributes where a backslash separates alternative values
    fn accepts_value_list(self) -> bool {
        matches!(
            self,
            Attribute::StudyUid | Attribute::SeriesUid | Attribute::Modality
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Empty value or a lone `*`
    Universal,
    Exact(String),
    /// Backslash separated values; any one may match
    List(Vec<String>),
    /// Upper-cased glob with `*` and `?`
    Wildcard(String),
    Range {
        from: Option<String>,
        to: Option<String>,
    },
}

impl Pattern {
    pub fn parse(attribute: Attribute, raw: &str) -> Self {
        let value = raw.trim();
        if value.is_empty() || value.chars().all(|c| c == '*') {
            return Pattern::Universal;
        }
        if attribute.accepts_value_list() && value.contains('\\') {
            return Pattern::List(
                value
                    .split('\\')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
        if attribute.is_date() {
            if let Some((from, to)) = value.split_once('-') {
                let bound = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());
                return Pattern::Range {
                    from: bound(from),
                    to: bound(to),
                };
            }
        }
        if value.contains(['*', '?']) {
            return Pattern::Wildcard(value.to_uppercase());
        }
        Pattern::Exact(value.to_string())
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        match self {
            Pattern::Universal => true,
            Pattern::Exact(value) => candidate == value,
            Pattern::List(values) => values.iter().any(|v| v == candidate),
            Pattern::Wildcard(glob) => glob_match(glob, &candidate.to_uppercase()),
            Pattern::Range { from, to } => {
                !candidate.is_empty()
                    && from.as_deref().map_or(true, |f| candidate >= f)
                    && to.as_deref().map_or(true, |t| candidate <= t)
            }
        }
    }

    /// Literal text before the first wildcard, if any
    pub fn literal_prefix(&self) -> Option<&str> {
        match self {
            Pattern::Wildcard(glob) => {
                let end = glob.find(['*', '?']).unwrap_or(glob.len());
                Some(&glob[..end]).filter(|p| !p.is_empty())
            }
            _ => None,
        }
    }
}

/// One filter of a query; filters combine with AND
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub attribute: Attribute,
    pub pattern: Pattern,
}

impl Filter {
    pub fn new(attribute: Attribute, value: &str) -> Self {
        Self {
            attribute,
            pattern: Pattern::parse(attribute, value),
        }
    }

    pub fn matches(&self, record: &SeriesRecord) -> bool {
        self.pattern.matches(&self.attribute.value(record))
    }

    pub fn is_universal(&self) -> bool {
        self.pattern == Pattern::Universal
    }
}

/// Anchored glob match; `*` is any run, `?` one character
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(value: &str) -> Pattern {
        Pattern::parse(Attribute::PatientName, value)
    }

    fn date(value: &str) -> Pattern {
        Pattern::parse(Attribute::StudyDate, value)
    }

    #[test]
    fn wildcard_matches_anywhere_in_the_name() {
        let smith = name("*SMITH*");
        assert!(smith.matches("JOHN SMITH"));
        assert!(smith.matches("SMITH JR"));
        assert!(smith.matches("john smith"));
        assert!(!smith.matches("SMYTH"));

        let single = name("SM?TH");
        assert!(single.matches("SMYTH"));
        assert!(!single.matches("SMITHS"));
    }

    #[test]
    fn date_ranges_are_inclusive_and_open_ended() {
        let january = date("20260101-20260131");
        assert!(january.matches("20260115"));
        assert!(january.matches("20260131"));
        assert!(!january.matches("20260201"));

        let after = date("20260101-");
        assert!(after.matches("20260101"));
        assert!(after.matches("20990101"));
        assert!(!after.matches("20251231"));

        let before = date("-20251231");
        assert!(before.matches("20250101"));
        assert!(!before.matches("20260101"));
        assert!(!before.matches(""));
    }

    #[test]
    fn empty_and_star_are_universal() {
        assert_eq!(name(""), Pattern::Universal);
        assert_eq!(name("*"), Pattern::Universal);
        assert!(name("").matches(""));
    }

    #[test]
    fn exact_and_uid_lists() {
        let exact = Pattern::parse(Attribute::PatientId, "PAT1");
        assert!(exact.matches("PAT1"));
        assert!(!exact.matches("PAT10"));

        let list = Pattern::parse(Attribute::SeriesUid, "1.2.3\\1.2.4");
        assert!(list.matches("1.2.4"));
        assert!(!list.matches("1.2.5"));
    }

    #[test]
    fn modality_values_are_alternatives() {
        let modalities = Pattern::parse(Attribute::Modality, "CT\\MR");
        assert_eq!(modalities, Pattern::List(vec!["CT".into(), "MR".into()]));
        assert!(modalities.matches("MR"));
        assert!(!modalities.matches("US"));

        let in_study = Attribute::from_tag(tags::MODALITIES_IN_STUDY).unwrap();
        assert!(Pattern::parse(in_study, "US\\CT").matches("CT"));
        // a single value stays an exact match
        assert_eq!(Pattern::parse(in_study, "CT"), Pattern::Exact("CT".into()));
    }

    #[test]
    fn literal_prefix_stops_at_first_wildcard() {
        assert_eq!(
            Pattern::parse(Attribute::PatientId, "PAT0*").literal_prefix(),
            Some("PAT0")
        );
        assert_eq!(Pattern::parse(Attribute::PatientId, "*X").literal_prefix(), None);
        assert_eq!(Pattern::parse(Attribute::PatientId, "X").literal_prefix(), None);
    }

    #[test]
    fn glob_backtracks() {
        assert!(glob_match("A*B*C", "AXXBYYBC"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("A*B", "AXXC"));
    }
}
