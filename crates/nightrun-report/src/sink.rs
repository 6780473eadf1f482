//! JSON report files.

use crate::document::{JobRecord, NotTodayRecord, ReportDocument, RunStatus};
use chrono::Local;
use nightrun_core::HostKey;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Renders the live state of a run into one global JSON document plus one
/// document per report-group tag.
pub struct ReportSink {
    dir: PathBuf,
    global: ReportDocument,
    groups: BTreeMap<String, ReportDocument>,
}

impl ReportSink {
    /// Build the documents from the initial job records and write them out.
    ///
    /// Hosts, applications, distributions and group tags are enumerated
    /// once here; later updates only replace the job records.
    pub fn new(
        dir: &Path,
        records: Vec<JobRecord>,
        not_today: Vec<NotTodayRecord>,
    ) -> io::Result<Self> {
        let mut hosts: Vec<HostKey> = Vec::new();
        let mut applications: Vec<String> = Vec::new();
        let mut distributions: Vec<String> = Vec::new();
        let mut tags: Vec<String> = Vec::new();

        for record in &records {
            let key = HostKey {
                host: record.host.clone(),
                port: record.port,
            };
            if !hosts.contains(&key) {
                hosts.push(key);
            }
            if let Some(app) = &record.application {
                if !applications.contains(app) {
                    applications.push(app.clone());
                }
            }
            if let Some(dist) = &record.distribution {
                if !distributions.contains(dist) {
                    distributions.push(dist.clone());
                }
            }
            if let Some(tag) = &record.group {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }
        for record in &not_today {
            if let Some(app) = &record.application {
                if !applications.contains(app) {
                    applications.push(app.clone());
                }
            }
            if let Some(dist) = &record.distribution {
                if !distributions.contains(dist) {
                    distributions.push(dist.clone());
                }
            }
        }

        let global = ReportDocument {
            hosts,
            applications,
            distributions,
            jobs: Vec::new(),
            jobs_not_today: not_today,
            updated: Local::now(),
            status: RunStatus::Running,
        };

        let mut groups = BTreeMap::new();
        for tag in tags {
            let mut doc = global.clone();
            doc.jobs_not_today = Vec::new();
            groups.insert(tag, doc);
        }

        std::fs::create_dir_all(dir)?;
        let mut sink = Self {
            dir: dir.to_path_buf(),
            global,
            groups,
        };
        sink.update(records)?;
        Ok(sink)
    }

    /// Replace every job record and rewrite the documents.
    pub fn update(&mut self, records: Vec<JobRecord>) -> io::Result<()> {
        let now = Local::now();
        for (tag, doc) in self.groups.iter_mut() {
            doc.jobs = records
                .iter()
                .filter(|r| r.group.as_deref() == Some(tag.as_str()))
                .cloned()
                .collect();
            doc.updated = now;
        }
        self.global.jobs = records;
        self.global.updated = now;
        self.write_all()
    }

    /// Stamp the terminal overall status and rewrite the documents.
    pub fn finish(&mut self, status: RunStatus) -> io::Result<()> {
        let now = Local::now();
        self.global.status = status;
        self.global.updated = now;
        for doc in self.groups.values_mut() {
            doc.status = status;
            doc.updated = now;
        }
        self.write_all()
    }

    fn write_all(&self) -> io::Result<()> {
        write_document(&self.dir.join("jobs_report.json"), &self.global)?;
        for (tag, doc) in &self.groups {
            let file = format!("jobs_report_{}.json", sanitize_tag(tag));
            write_document(&self.dir.join(file), doc)?;
        }
        Ok(())
    }
}

fn write_document(path: &Path, doc: &ReportDocument) -> io::Result<()> {
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
