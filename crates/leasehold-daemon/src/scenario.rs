//! Scripted runs against the simulated ledger.
//!
//! A scenario file names principals with starting balances, the agreements
//! to deploy, and an ordered list of actions:
//!
//! ```toml
//! [[principals]]
//! name = "lender"
//! address = "0x1111111111111111111111111111111111111111"
//! balance = "10"
//!
//! [[agreements]]
//! kind = "loan"
//! name = "loan-a"
//! creditor = "lender"
//! debtor = "borrower"
//! principal = "2.5"
//! rate = "5.5"
//! duration = 12
//! grace_allowance = 2
//!
//! [[actions]]
//! type = "submit"
//! agreement = "loan-a"
//! operation = "fund"
//! caller = "lender"
//! ```
//!
//! Operation failures are recorded in the step outcome and do not stop the
//! run; a scenario may exercise rejections on purpose.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use leasehold_core::agreement::{Address, AgreementKind, Parties, Terms};
use leasehold_core::amount::{Amount, AmountError, Rate};
use leasehold_core::schedule::PortfolioSummary;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{EngineError, SyncEngine};
use crate::ledger::Operation;
use crate::ledger::simulated::SimulatedLedger;
use crate::synchronizer::AgreementView;

const fn default_settle_millis() -> u64 {
    100
}

/// Errors that abort a scenario.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScenarioError {
    /// The scenario file could not be read.
    #[error("failed to read scenario: {0}")]
    Io(#[from] std::io::Error),

    /// The scenario file is not valid TOML for this format.
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),

    /// A principal name was used but never declared.
    #[error("unknown principal '{0}'")]
    UnknownPrincipal(String),

    /// An agreement name was used but never declared.
    #[error("unknown agreement '{0}'")]
    UnknownAgreement(String),

    /// Two entries share a name.
    #[error("duplicate name '{0}'")]
    DuplicateName(String),

    /// Terms could not be built.
    #[error("invalid terms for '{name}': {source}")]
    Terms {
        /// Agreement name.
        name: String,
        /// Underlying error.
        source: AmountError,
    },

    /// The ledger refused to deploy an agreement.
    #[error("failed to deploy '{name}': {reason}")]
    Deploy {
        /// Agreement name.
        name: String,
        /// Ledger error.
        reason: String,
    },

    /// The engine could not observe an agreement.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A principal and its starting balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalSpec {
    /// Name used by agreements and actions.
    pub name: String,
    /// Ledger address.
    pub address: Address,
    /// Starting balance.
    #[serde(default)]
    pub balance: Amount,
}

/// An agreement to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum AgreementSpec {
    /// A loan.
    Loan {
        /// Name used by actions.
        name: String,
        /// Lender principal name.
        creditor: String,
        /// Borrower principal name.
        debtor: String,
        /// Amount lent.
        principal: Amount,
        /// Interest rate in percent.
        #[serde(default)]
        rate: Rate,
        /// Number of installments.
        duration: u32,
        /// Periods the borrower may skip.
        #[serde(default)]
        grace_allowance: u32,
        /// Collateral posted on activation.
        #[serde(default)]
        collateral: Amount,
        /// Period length override.
        #[serde(default)]
        period_secs: Option<u64>,
    },
    /// A rental lease.
    Rental {
        /// Name used by actions.
        name: String,
        /// Landlord principal name.
        landlord: String,
        /// Tenant principal name.
        tenant: String,
        /// Rent per period.
        monthly_rent: Amount,
        /// Lease length in periods.
        months: u32,
        /// Deposit posted on activation.
        #[serde(default)]
        security_deposit: Amount,
        /// Period length override.
        #[serde(default)]
        period_secs: Option<u64>,
    },
}

impl AgreementSpec {
    /// The agreement's name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Loan { name, .. } | Self::Rental { name, .. } => name,
        }
    }

    fn build(
        &self,
        principals: &HashMap<String, Address>,
    ) -> Result<(Parties, Terms), ScenarioError> {
        let lookup = |name: &str| {
            principals
                .get(name)
                .cloned()
                .ok_or_else(|| ScenarioError::UnknownPrincipal(name.to_string()))
        };
        let (parties, terms, period_secs) = match self {
            Self::Loan {
                creditor,
                debtor,
                principal,
                rate,
                duration,
                grace_allowance,
                collateral,
                period_secs,
                ..
            } => (
                Parties {
                    kind: AgreementKind::Loan,
                    creditor: lookup(creditor)?,
                    debtor: lookup(debtor)?,
                },
                Terms::loan(*principal, *rate, *duration, *grace_allowance)
                    .with_collateral(*collateral),
                *period_secs,
            ),
            Self::Rental {
                name,
                landlord,
                tenant,
                monthly_rent,
                months,
                security_deposit,
                period_secs,
            } => (
                Parties {
                    kind: AgreementKind::Rental,
                    creditor: lookup(landlord)?,
                    debtor: lookup(tenant)?,
                },
                Terms::rental(*monthly_rent, *months, *security_deposit).map_err(|source| {
                    ScenarioError::Terms {
                        name: name.clone(),
                        source,
                    }
                })?,
                *period_secs,
            ),
        };
        let terms = match period_secs {
            Some(secs) => terms.with_period_secs(secs),
            None => terms,
        };
        Ok((parties, terms))
    }
}

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Action {
    /// Run an operation through the orchestrator.
    Submit {
        /// Agreement name.
        agreement: String,
        /// Operation to run.
        operation: Operation,
        /// Calling principal name.
        caller: String,
    },
    /// Move the ledger clock forward.
    AdvanceTime {
        /// Seconds to advance.
        secs: u64,
    },
    /// Default the agreement on the ledger.
    DeclareDefault {
        /// Agreement name.
        agreement: String,
    },
    /// Drop every live event stream.
    Disconnect,
    /// Give background tasks time to catch up.
    Settle {
        /// Milliseconds to wait.
        #[serde(default = "default_settle_millis")]
        millis: u64,
    },
    /// Stop observing the agreement.
    Unobserve {
        /// Agreement name.
        agreement: String,
    },
}

/// A parsed scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Principals and balances.
    #[serde(default)]
    pub principals: Vec<PrincipalSpec>,
    /// Agreements to deploy.
    #[serde(default)]
    pub agreements: Vec<AgreementSpec>,
    /// Steps to run in order.
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// What happened in one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    /// Zero-based step index.
    pub step: usize,
    /// Action type.
    pub action: &'static str,
    /// Agreement the step concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
    /// Whether the step succeeded.
    pub ok: bool,
    /// Confirming transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    /// Follow-up sync warning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_warning: Option<String>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    fn new(step: usize, action: &'static str, agreement: Option<&str>) -> Self {
        Self {
            step,
            action,
            agreement: agreement.map(str::to_string),
            ok: true,
            tx_ref: None,
            sync_warning: None,
            error: None,
        }
    }

    fn failed(mut self, error: impl ToString) -> Self {
        self.ok = false;
        self.error = Some(error.to_string());
        self
    }
}

/// The result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Per-step outcomes.
    pub steps: Vec<StepOutcome>,
    /// Final views by agreement name.
    pub views: Vec<(String, AgreementView)>,
    /// Portfolio figures over the final views.
    pub summary: PortfolioSummary,
}

impl Scenario {
    /// Reads a scenario file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses a scenario.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(content)?)
    }

    /// Credits balances and deploys every agreement on `ledger`. Returns
    /// agreement addresses by name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or duplicate names, invalid terms or a
    /// refused deployment.
    pub fn deploy(&self, ledger: &SimulatedLedger) -> Result<Deployment, ScenarioError> {
        let mut principals = HashMap::new();
        for principal in &self.principals {
            if principals
                .insert(principal.name.clone(), principal.address.clone())
                .is_some()
            {
                return Err(ScenarioError::DuplicateName(principal.name.clone()));
            }
            ledger.credit(&principal.address, principal.balance);
        }

        let mut agreements = Vec::with_capacity(self.agreements.len());
        for entry in &self.agreements {
            let name = entry.name().to_string();
            if agreements.iter().any(|(n, _)| *n == name) {
                return Err(ScenarioError::DuplicateName(name));
            }
            let (parties, terms) = entry.build(&principals)?;
            let address = ledger
                .deploy(&parties, &terms)
                .map_err(|e| ScenarioError::Deploy {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            agreements.push((name, address));
        }
        Ok(Deployment {
            principals,
            agreements,
        })
    }
}

/// Addresses assigned by [`Scenario::deploy`].
#[derive(Debug, Clone, Default)]
pub struct Deployment {
    principals: HashMap<String, Address>,
    agreements: Vec<(String, Address)>,
}

impl Deployment {
    /// Agreements in declaration order.
    #[must_use]
    pub fn agreements(&self) -> &[(String, Address)] {
        &self.agreements
    }

    /// Address of the named agreement.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::UnknownAgreement`].
    pub fn agreement(&self, name: &str) -> Result<&Address, ScenarioError> {
        self.agreements
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
            .ok_or_else(|| ScenarioError::UnknownAgreement(name.to_string()))
    }

    /// Address of the named principal.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::UnknownPrincipal`].
    pub fn principal(&self, name: &str) -> Result<&Address, ScenarioError> {
        self.principals
            .get(name)
            .ok_or_else(|| ScenarioError::UnknownPrincipal(name.to_string()))
    }
}

/// Observes every deployed agreement, runs the actions and collects the
/// final views.
///
/// # Errors
///
/// Returns an error if an agreement cannot be observed or an action names
/// an unknown agreement or principal.
pub async fn run(
    scenario: &Scenario,
    deployment: &Deployment,
    ledger: &SimulatedLedger,
    engine: &SyncEngine,
) -> Result<ScenarioReport, ScenarioError> {
    for (name, address) in deployment.agreements() {
        engine.observe(address).await?;
        info!(agreement = %name, address = %address, "observing");
    }

    let mut steps = Vec::with_capacity(scenario.actions.len());
    for (step, action) in scenario.actions.iter().enumerate() {
        let outcome = match action {
            Action::Submit {
                agreement,
                operation,
                caller,
            } => {
                let address = deployment.agreement(agreement)?;
                let caller = deployment.principal(caller)?;
                let outcome = StepOutcome::new(step, operation.as_str(), Some(agreement));
                match engine
                    .orchestrator()
                    .execute(address, *operation, caller)
                    .await
                {
                    Ok(report) => StepOutcome {
                        tx_ref: report.outcome.tx_ref,
                        sync_warning: report.sync_warning,
                        ..outcome
                    },
                    Err(e) => {
                        warn!(step, agreement = %agreement, error = %e, "operation failed");
                        outcome.failed(e)
                    },
                }
            },
            Action::AdvanceTime { secs } => {
                ledger.advance_time(*secs);
                StepOutcome::new(step, "advance_time", None)
            },
            Action::DeclareDefault { agreement } => {
                let address = deployment.agreement(agreement)?;
                let outcome = StepOutcome::new(step, "declare_default", Some(agreement));
                match ledger.declare_default(address) {
                    Ok(receipt) => StepOutcome {
                        tx_ref: Some(receipt.tx_ref),
                        ..outcome
                    },
                    Err(e) => outcome.failed(e),
                }
            },
            Action::Disconnect => {
                ledger.disconnect_all();
                StepOutcome::new(step, "disconnect", None)
            },
            Action::Settle { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                StepOutcome::new(step, "settle", None)
            },
            Action::Unobserve { agreement } => {
                let address = deployment.agreement(agreement)?;
                let outcome = StepOutcome::new(step, "unobserve", Some(agreement));
                if engine.unobserve(address) {
                    outcome
                } else {
                    outcome.failed("agreement was not observed")
                }
            },
        };
        steps.push(outcome);
    }

    let mut views = Vec::with_capacity(deployment.agreements().len());
    for (name, address) in deployment.agreements() {
        let synchronizer = engine.synchronizer();
        if let Err(e) = synchronizer.reconcile(address).await {
            warn!(agreement = %name, error = %e, "final reconciliation failed");
        }
        let view = synchronizer
            .ensure_view(address)
            .await
            .map_err(EngineError::from)?;
        views.push((name.clone(), view));
    }
    let summary = PortfolioSummary::from_agreements(views.iter().map(|(_, v)| &v.agreement));
    Ok(ScenarioReport {
        steps,
        views,
        summary,
    })
}
