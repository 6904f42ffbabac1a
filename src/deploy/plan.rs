// ABOUTME: Deployment plans: the ordered steps one reconciliation run executes.
// ABOUTME: Launch plans are computed from what the record already has; an interrupted redeploy resumes as one.

use crate::state::{ServiceRecord, ServiceStatus};
use nonempty::{NonEmpty, nonempty};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CreateNode,
    AwaitNode,
    CreateDatabase,
    AwaitDatabase,
    BuildImage,
    StartContainer,
    ReplaceContainer,
    CheckReadiness,
    RetireContainer,
}

impl Step {
    /// The status a service is in while this step runs.
    pub fn phase(self) -> ServiceStatus {
        match self {
            Step::CreateNode | Step::AwaitNode | Step::CreateDatabase | Step::AwaitDatabase => {
                ServiceStatus::Provisioning
            }
            Step::BuildImage => ServiceStatus::Building,
            Step::StartContainer
            | Step::ReplaceContainer
            | Step::CheckReadiness
            | Step::RetireContainer => ServiceStatus::Starting,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::CreateNode => "create-node",
            Step::AwaitNode => "await-node",
            Step::CreateDatabase => "create-database",
            Step::AwaitDatabase => "await-database",
            Step::BuildImage => "build-image",
            Step::StartContainer => "start-container",
            Step::ReplaceContainer => "replace-container",
            Step::CheckReadiness => "check-readiness",
            Step::RetireContainer => "retire-container",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Launch,
    Redeploy,
}

/// Ordered steps for one reconciliation run. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    kind: PlanKind,
    steps: NonEmpty<Step>,
    /// Continues a redeploy an earlier run left unfinished.
    resumed: bool,
}

impl DeploymentPlan {
    /// Steps still needed to bring the service up, skipping work a previous
    /// interrupted or failed run already committed.
    pub fn for_launch(record: &ServiceRecord) -> Self {
        if record.rollback.is_some() && record.node().is_some() {
            return Self::resume_redeploy(record);
        }

        let mut prefix = Vec::new();

        match record.node() {
            None => prefix.extend([Step::CreateNode, Step::AwaitNode]),
            Some(node) if !node.ready => prefix.push(Step::AwaitNode),
            Some(_) => {}
        }

        if record.spec.database.is_some() {
            match &record.database {
                None => prefix.extend([Step::CreateDatabase, Step::AwaitDatabase]),
                Some(db) if !db.is_online() => prefix.push(Step::AwaitDatabase),
                Some(_) => {}
            }
        }

        // The image of an interrupted run that already reached `starting` is reused.
        let built = record.image.is_some() && record.status == ServiceStatus::Starting;
        if !built {
            prefix.push(Step::BuildImage);
        }

        let mut steps = nonempty![Step::StartContainer, Step::CheckReadiness];
        for step in prefix.into_iter().rev() {
            steps.insert(0, step);
        }

        Self {
            kind: PlanKind::Launch,
            steps,
            resumed: false,
        }
    }

    /// Rebuild and swap the container on the existing node. An interrupted
    /// redeploy is continued; a service that is not running resumes its
    /// launch instead.
    pub fn for_redeploy(record: &ServiceRecord) -> Self {
        if record.node().is_none() {
            return Self::for_launch(record);
        }
        if record.rollback.is_some() {
            return Self::resume_redeploy(record);
        }
        if record.status != ServiceStatus::Running {
            return Self::for_launch(record);
        }
        Self {
            kind: PlanKind::Redeploy,
            steps: nonempty![
                Step::BuildImage,
                Step::ReplaceContainer,
                Step::CheckReadiness,
                Step::RetireContainer
            ],
            resumed: false,
        }
    }

    // The replacement image is reused once the run got as far as `starting`.
    fn resume_redeploy(record: &ServiceRecord) -> Self {
        let built = record.image.is_some() && record.status == ServiceStatus::Starting;
        let mut steps = nonempty![
            Step::ReplaceContainer,
            Step::CheckReadiness,
            Step::RetireContainer
        ];
        if !built {
            steps.insert(0, Step::BuildImage);
        }
        Self {
            kind: PlanKind::Redeploy,
            steps,
            resumed: true,
        }
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        self.steps.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Status committed when the run starts.
    pub fn initial_status(&self) -> ServiceStatus {
        self.steps.head.phase()
    }

    /// Status committed once the step at `index` has succeeded.
    pub fn status_after(&self, index: usize) -> ServiceStatus {
        self.steps
            .get(index + 1)
            .map_or(ServiceStatus::Running, |next| next.phase())
    }

    pub fn contains(&self, step: Step) -> bool {
        self.steps.iter().any(|s| *s == step)
    }
}

/// Name of the database cluster created for a service.
pub fn database_name(service: &str) -> String {
    format!("{}-db", service)
}
