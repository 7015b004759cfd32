use crate::storage::Location;
use common::Result;
use common::config::OutputConfig;
use std::fmt;

/// The five output tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Songs,
    Artists,
    Users,
    Time,
    Songplays,
}

impl TableKind {
    pub fn partition_by(&self) -> &'static [&'static str] {
        match self {
            TableKind::Songs => &["year", "artist_id"],
            TableKind::Time | TableKind::Songplays => &["year", "month"],
            TableKind::Artists | TableKind::Users => &[],
        }
    }

    /// Table name as configured in the `[OUTPUT]` section.
    pub fn configured_name<'a>(&self, output: &'a OutputConfig) -> &'a str {
        let name = match self {
            TableKind::Songs => &output.songtable,
            TableKind::Artists => &output.artisttable,
            TableKind::Users => &output.usertable,
            TableKind::Time => &output.timetable,
            TableKind::Songplays => &output.songplay,
        };
        name.trim().trim_matches('/')
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TableKind::Songs => "songs",
            TableKind::Artists => "artists",
            TableKind::Users => "users",
            TableKind::Time => "time",
            TableKind::Songplays => "songplays",
        };
        f.write_str(label)
    }
}

/// Where and how one output table is written.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub kind: TableKind,
    pub name: String,
    pub location: Location,
}

impl TableSpec {
    pub fn new(kind: TableKind, name: &str, output_root: &Location) -> Result<Self> {
        Ok(Self {
            kind,
            name: name.to_string(),
            location: output_root.child(name)?,
        })
    }

    pub fn partition_by(&self) -> &'static [&'static str] {
        self.kind.partition_by()
    }
}
