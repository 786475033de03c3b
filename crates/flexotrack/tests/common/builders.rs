//! Builder patterns for creating test data programmatically.

#![allow(dead_code)]

use chrono::{DateTime, Utc};

use flexotrack::program::InitialStatus;
use flexotrack::NewProgram;

/// Builder for `NewProgram` requests.
pub struct ProgramBuilder {
    request: NewProgram,
}

impl ProgramBuilder {
    pub fn new(work_order: &str, machine: u32) -> Self {
        Self {
            request: NewProgram {
                machine_number: machine,
                work_order: work_order.to_string(),
                article_code: format!("ART-{}", work_order),
                client_name: "Acme Foods".to_string(),
                reference: "Snack wrap 200g".to_string(),
                short_code: "SW".to_string(),
                substrate: "BOPP 20".to_string(),
                weight_kg: 500.0,
                colors: vec!["Cyan".to_string(), "Black".to_string()],
                color_count: 2,
                ..Default::default()
            },
        }
    }

    pub fn client(mut self, client: &str) -> Self {
        self.request.client_name = client.to_string();
        self
    }

    pub fn weight(mut self, weight_kg: f64) -> Self {
        self.request.weight_kg = weight_kg;
        self
    }

    pub fn colors(mut self, colors: &[&str]) -> Self {
        self.request.colors = colors.iter().map(|c| c.to_string()).collect();
        self.request.color_count = colors.len() as u32;
        self
    }

    pub fn preparing(mut self) -> Self {
        self.request.initial_status = InitialStatus::Preparing;
        self
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.request.start_time = Some(start);
        self
    }

    pub fn notes(mut self, notes: &str) -> Self {
        self.request.notes = Some(notes.to_string());
        self
    }

    pub fn build(self) -> NewProgram {
        self.request
    }
}
