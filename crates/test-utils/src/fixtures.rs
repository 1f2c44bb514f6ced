//! Fixture builders for common domain entities.

use time::OffsetDateTime;
use uuid::Uuid;

use outflow::model::{
    Contact, Deal, DealStage, Meeting, SendSettings, Sequence, SequenceStats, SequenceStatus,
    SequenceStep, Workspace,
};

/// An active sequence with `steps` contiguous steps. Step 1 has no delay;
/// later steps wait `delay_days` after the previous send.
pub fn sequence(id: Uuid, steps: u32, delay_days: u32) -> Sequence {
    Sequence {
        id,
        name: format!("sequence-{}", &id.to_string()[..8]),
        status: SequenceStatus::Active,
        steps: (1..=steps)
            .map(|n| SequenceStep {
                step_number: n,
                delay_days: if n == 1 { 0 } else { delay_days },
                subject_template: format!("Subject {n}"),
                body_template: format!("body {n}"),
                ab_variant: None,
            })
            .collect(),
        settings: SendSettings {
            // Wide-open window so scheduling math stays visible in tests.
            daily_cap: 1000,
            window_start_hour: 0,
            window_end_hour: 24,
            skip_weekends: false,
        },
        stats: SequenceStats::default(),
    }
}

pub fn contact(id: Uuid, company_id: Option<Uuid>) -> Contact {
    Contact {
        id,
        email: format!("contact-{}@example.com", &id.to_string()[..8]),
        first_name: "Jordan".to_string(),
        last_name: "Reyes".to_string(),
        title: Some("VP Engineering".to_string()),
        company_id,
    }
}

pub fn workspace(id: Uuid, mailbox_connected: bool) -> Workspace {
    Workspace {
        id,
        name: format!("workspace-{}", &id.to_string()[..8]),
        mailbox_connected,
    }
}

pub fn meeting(id: Uuid, workspace_id: Uuid, contact_id: Uuid, starts_at: OffsetDateTime) -> Meeting {
    Meeting {
        id,
        workspace_id,
        contact_id,
        title: "Discovery call".to_string(),
        starts_at,
        prep_notes: None,
    }
}

pub fn deal(id: Uuid, workspace_id: Uuid, stage: DealStage, updated_at: OffsetDateTime) -> Deal {
    Deal {
        id,
        workspace_id,
        name: format!("deal-{}", &id.to_string()[..8]),
        stage,
        value_cents: 250_000,
        score: None,
        updated_at,
    }
}
