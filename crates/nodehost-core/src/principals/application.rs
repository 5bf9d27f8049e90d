//! Security principals of one application on one node.

use crate::config::{
    HostingConfig, APPLICATION_GROUP_NAME_PREFIX, APPLICATION_LOCAL_GROUP_COMMENT,
    PRINCIPAL_MUTEX_PREFIX,
};
use crate::error::{ErrorCode, HostingError, Result};
use crate::ids::SYSTEM_APPLICATION_NUMBER;
use crate::model::{
    PrincipalsDescription, SecurityGroupDescription, SecurityPrincipalAccountType,
    SecurityUserDescription,
};
use crate::principals::comment::{
    add_node_to_comment, create_comment, is_principal_owned, remove_node_from_comment,
};
use crate::principals::lock::NamedLocks;
use crate::principals::state::PrincipalsState;
use crate::principals::store::{well_known_sid, AccountKind, AccountSpec, AccountStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hosting switches that shape principal setup.
#[derive(Debug, Clone)]
pub struct PrincipalsSettings {
    /// Force the NTLM (shared account) policy on every principal.
    pub ntlm_authentication_enabled: bool,
    /// Delay before deferred users are retried.
    pub user_creation_retry_timeout: Duration,
}

impl From<&HostingConfig> for PrincipalsSettings {
    fn from(config: &HostingConfig) -> Self {
        Self {
            ntlm_authentication_enabled: config.ntlm_authentication_enabled,
            user_creation_retry_timeout: config.user_creation_retry_timeout,
        }
    }
}

/// Request to set up (or extend) an application's principals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureSecurityPrincipalRequest {
    pub application_id: String,
    pub node_id: String,
    /// Application number, used to derive account and group names.
    pub application_package_counter: u32,
    pub principals: PrincipalsDescription,
    #[serde(default)]
    pub allowed_user_creation_failure_count: usize,
    /// Add users to already set up principals instead of creating them.
    #[serde(default)]
    pub update_existing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    Group,
    User(SecurityPrincipalAccountType),
}

/// A created or loaded account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPrincipal {
    /// Logical name from the application manifest.
    pub name: String,
    /// Actual account name.
    pub account_name: String,
    pub sid: String,
    pub kind: PrincipalKind,
    /// The account is shared and reference counted through its comment.
    pub ntlm_authentication_enabled: bool,
}

impl SecurityPrincipal {
    pub fn is_local_user(&self) -> bool {
        self.kind == PrincipalKind::User(SecurityPrincipalAccountType::LocalUser)
    }

    fn account_kind(&self) -> AccountKind {
        match self.kind {
            PrincipalKind::Group => AccountKind::Group,
            PrincipalKind::User(_) => AccountKind::User,
        }
    }
}

/// Public view of a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalInformation {
    pub name: String,
    pub account_name: String,
    pub sid: String,
    pub is_local_user: bool,
}

#[derive(Debug, Default)]
struct Principals {
    description: PrincipalsDescription,
    groups: Vec<SecurityPrincipal>,
    users: Vec<SecurityPrincipal>,
    /// Logical group name to actual account name.
    group_names: HashMap<String, String>,
    remove_on_close: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Users and groups of one application on one node.
///
/// Open creates the declared principals. Users whose certificate is not yet
/// installed are deferred and retried on a timer; the instance is `Opened`
/// once every user exists. Close deletes (or merely releases) the accounts.
pub struct ApplicationPrincipals {
    application_id: String,
    node_id: String,
    application_package_counter: u32,
    application_group_name: String,
    allowed_user_failure_count: usize,
    settings: PrincipalsSettings,
    store: Arc<dyn AccountStore>,
    locks: NamedLocks,
    state: Mutex<PrincipalsState>,
    principals: Mutex<Principals>,
    retry_cancel: Arc<Notify>,
    retry_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ApplicationPrincipals {
    pub fn new(
        request: ConfigureSecurityPrincipalRequest,
        settings: PrincipalsSettings,
        store: Arc<dyn AccountStore>,
        locks: NamedLocks,
    ) -> Arc<Self> {
        let application_group_name = Self::application_local_group_name(
            &request.node_id,
            request.application_package_counter,
        );
        Arc::new(Self {
            application_id: request.application_id,
            node_id: request.node_id,
            application_package_counter: request.application_package_counter,
            application_group_name,
            allowed_user_failure_count: request.allowed_user_creation_failure_count,
            settings,
            store,
            locks,
            state: Mutex::new(PrincipalsState::Inactive),
            principals: Mutex::new(Principals {
                description: request.principals,
                remove_on_close: true,
                ..Principals::default()
            }),
            retry_cancel: Arc::new(Notify::new()),
            retry_handle: Mutex::new(None),
        })
    }

    /// Name of the per-application local group: `WF-App-<counter>-<node id>`.
    pub fn application_local_group_name(node_id: &str, application_counter: u32) -> String {
        format!("{APPLICATION_GROUP_NAME_PREFIX}{application_counter}-{node_id}")
    }

    /// Account name of a shared principal.
    ///
    /// System application accounts keep the bare principal name.
    pub fn shared_account_name(principal_name: &str, application_counter: u32) -> String {
        if application_counter == SYSTEM_APPLICATION_NUMBER {
            principal_name.to_string()
        } else {
            format!("{principal_name}{application_counter}")
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn application_group_name(&self) -> &str {
        &self.application_group_name
    }

    pub fn state(&self) -> PrincipalsState {
        *lock(&self.state)
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn transition(&self, next: PrincipalsState) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            return Err(HostingError::invalid_state(format!("predecessor of {next}"), *state));
        }
        let previous = std::mem::replace(&mut *state, next);
        debug!(app_id = %self.application_id, node_id = %self.node_id, from = %previous, to = %next, "Principals state transition");
        Ok(())
    }

    fn transition_to_failed(&self) {
        if let Err(e) = self.transition(PrincipalsState::Failed) {
            debug!(app_id = %self.application_id, error = %e, "Could not transition to Failed");
        }
    }

    /// Log a failed transition, optionally moving to `Failed`. Returns true on success.
    fn check_transition(&self, result: &Result<()>, target: PrincipalsState, fail_on_error: bool) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    app_id = %self.application_id,
                    node_id = %self.node_id,
                    target = %target,
                    error = %e,
                    "Principals state transition failed"
                );
                if fail_on_error {
                    self.transition_to_failed();
                }
                false
            }
        }
    }

    /// Enter `GettingPrincipal`, returning the state to restore.
    fn begin_query(&self) -> Result<PrincipalsState> {
        let mut state = lock(&self.state);
        let previous = *state;
        if !previous.can_transition_to(PrincipalsState::GettingPrincipal) {
            return Err(HostingError::invalid_state(PrincipalsState::GettingPrincipal, previous));
        }
        *state = PrincipalsState::GettingPrincipal;
        Ok(previous)
    }

    /// # Panics
    ///
    /// Panics if `previous` is not a state a query can start from.
    fn end_query(&self, previous: PrincipalsState) -> Result<()> {
        assert!(
            previous.is_restorable(),
            "cannot restore principals state {previous} after a query"
        );
        let result = self.transition(previous);
        self.check_transition(&result, previous, true);
        result
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Create or load every declared principal.
    ///
    /// Returns `ApplicationPrincipalAbortable` when setup fails; the caller
    /// must then abort.
    pub fn open(self: &Arc<Self>) -> Result<()> {
        if self.state() == PrincipalsState::Opened {
            info!(app_id = %self.application_id, node_id = %self.node_id, "Application principals already opened");
            return Ok(());
        }

        let result = self.transition(PrincipalsState::Opening);
        if !self.check_transition(&result, PrincipalsState::Opening, false) {
            return result;
        }

        let mut failed_users = Vec::new();
        let mut result = self.setup_application_principals(&mut failed_users);
        if result.is_ok() {
            result = if failed_users.is_empty() {
                self.transition(PrincipalsState::Opened)
            } else {
                self.schedule_user_creation(failed_users)
            };
        }

        if let Err(e) = result {
            warn!(app_id = %self.application_id, node_id = %self.node_id, error = %e, "Opening application principals failed");
            self.transition_to_failed();
            return Err(HostingError::ApplicationPrincipalAbortable);
        }

        info!(app_id = %self.application_id, node_id = %self.node_id, state = %self.state(), "Opened application principals");
        Ok(())
    }

    fn setup_application_principals(&self, failed_users: &mut Vec<SecurityUserDescription>) -> Result<()> {
        let description = lock(&self.principals).description.clone();
        info!(
            app_id = %self.application_id,
            groups = description.groups.len(),
            users = description.users.len(),
            "Setting up application principals"
        );

        for mut group in description.groups {
            if self.settings.ntlm_authentication_enabled {
                group.ntlm_authentication_enabled = true;
            }
            let principal = self.create_group(&group).map_err(|e| {
                warn!(app_id = %self.application_id, group = %group.name, error = %e, "Creating group failed");
                e
            })?;

            let mut principals = lock(&self.principals);
            principals
                .group_names
                .insert(principal.name.clone(), principal.account_name.clone());
            principals.groups.push(principal);
        }

        let mut configure_group = false;
        for user in description.users {
            if user.is_local_user() {
                configure_group = true;
            }

            match self.process_user(&user) {
                Ok(()) => {}
                Err(e)
                    if e.is(ErrorCode::CertificateNotFound)
                        && failed_users.len() < self.allowed_user_failure_count =>
                {
                    info!(app_id = %self.application_id, user = %user.name, error = %e, "Deferring user creation");
                    failed_users.push(user);
                }
                Err(e) => return Err(e),
            }
        }

        if configure_group {
            self.configure_application_group_and_membership()
        } else {
            Ok(())
        }
    }

    fn create_group(&self, group: &SecurityGroupDescription) -> Result<SecurityPrincipal> {
        let mut spec = AccountSpec::new(AccountKind::Group, String::new());
        spec.member_of = group.system_groups.clone();

        let (account_name, sid) =
            self.create_or_load_security_principal(&group.name, spec, group.ntlm_authentication_enabled)?;
        Ok(SecurityPrincipal {
            name: group.name.clone(),
            account_name,
            sid,
            kind: PrincipalKind::Group,
            ntlm_authentication_enabled: group.ntlm_authentication_enabled,
        })
    }

    fn process_user(&self, description: &SecurityUserDescription) -> Result<()> {
        let mut user = description.clone();
        if self.settings.ntlm_authentication_enabled {
            user.ntlm_authentication_enabled = true;
        }

        let parent_groups: Vec<String> = {
            let principals = lock(&self.principals);
            user.parent_application_groups
                .iter()
                .map(|logical| match principals.group_names.get(logical) {
                    Some(actual) => actual.clone(),
                    None if cfg!(unix) => logical.clone(),
                    None => panic!("group name {logical} not found in application group name map"),
                })
                .collect()
        };

        let principal = if user.is_local_user() {
            let mut spec = AccountSpec::new(AccountKind::User, String::new());
            spec.member_of = parent_groups;
            spec.member_of.extend(user.parent_system_groups.iter().cloned());
            spec.certificate_thumbprint = user.x509_find_value.clone();

            let (account_name, sid) =
                self.create_or_load_security_principal(&user.name, spec, user.ntlm_authentication_enabled)?;
            SecurityPrincipal {
                name: user.name.clone(),
                account_name,
                sid,
                kind: PrincipalKind::User(user.account_type),
                ntlm_authentication_enabled: user.ntlm_authentication_enabled,
            }
        } else {
            let sid = match well_known_sid(user.account_type) {
                Some(sid) => sid.to_string(),
                None => {
                    self.store.configure_account(&user.account_name, AccountKind::User)?;
                    self.store.load_account(&user.account_name)?
                }
            };
            SecurityPrincipal {
                name: user.name.clone(),
                account_name: user.account_name.clone(),
                sid,
                kind: PrincipalKind::User(user.account_type),
                ntlm_authentication_enabled: false,
            }
        };

        lock(&self.principals).users.push(principal);
        Ok(())
    }

    /// Create a principal's account, or join an existing shared one.
    ///
    /// Returns `(account name, SID)`.
    fn create_or_load_security_principal(
        &self,
        principal_name: &str,
        mut spec: AccountSpec,
        shared: bool,
    ) -> Result<(String, String)> {
        spec.comment = create_comment(principal_name, &self.node_id, &self.application_id);

        if !shared {
            let (account_name, sid) = self.store.create_account_with_random_name(principal_name, &spec)?;
            info!(app_id = %self.application_id, principal = %principal_name, account = %account_name, "Created account");
            return Ok((account_name, sid));
        }

        let kind = spec.kind;
        let account_name = Self::shared_account_name(principal_name, self.application_package_counter);
        let mutex_name = format!("{PRINCIPAL_MUTEX_PREFIX}{account_name}");

        self.locks.with_lock(&mutex_name, || {
            match self.store.get_comment(kind, &account_name) {
                Ok(comment) => {
                    let updated = add_node_to_comment(&comment, &self.node_id, &self.application_id)?;
                    if let Err(e) = self.store.update_comment(kind, &account_name, &updated) {
                        assert!(
                            !e.is(ErrorCode::NotFound),
                            "updating the comment of {account_name} cannot fail with NotFound"
                        );
                        warn!(app_id = %self.application_id, account = %account_name, error = %e, "Updating account comment failed");
                        return Err(e);
                    }

                    let sid = match self.store.load_account(&account_name) {
                        Err(e) if e.is(ErrorCode::NotFound) => {
                            panic!("loading existing account {account_name} cannot fail with NotFound")
                        }
                        result => result?,
                    };
                    info!(app_id = %self.application_id, account = %account_name, comment = %updated, "Loaded shared account");
                    Ok((account_name.clone(), sid))
                }
                Err(e) if e.is(ErrorCode::NotFound) => {
                    let sid = self.store.create_account(&account_name, &spec)?;
                    info!(app_id = %self.application_id, account = %account_name, comment = %spec.comment, "Created shared account");
                    Ok((account_name.clone(), sid))
                }
                Err(e) => {
                    warn!(app_id = %self.application_id, account = %account_name, error = %e, "Reading account comment failed");
                    Err(e)
                }
            }
        })
    }

    fn configure_application_group_and_membership(&self) -> Result<()> {
        let spec = AccountSpec::new(AccountKind::Group, APPLICATION_LOCAL_GROUP_COMMENT);
        match self.store.create_account(&self.application_group_name, &spec) {
            Ok(_) | Err(HostingError::AlreadyExists(_)) => {}
            Err(e) => {
                warn!(app_id = %self.application_id, group = %self.application_group_name, error = %e, "Creating application group failed");
                return Err(e);
            }
        }

        let members: Vec<String> = {
            let principals = lock(&self.principals);
            let mut seen = HashSet::new();
            principals
                .users
                .iter()
                .filter(|u| u.is_local_user())
                .filter(|u| seen.insert(u.sid.to_ascii_uppercase()))
                .map(|u| u.sid.clone())
                .collect()
        };

        if members.is_empty() {
            return Ok(());
        }
        let result = self.store.set_group_members(&self.application_group_name, &members);
        debug!(
            app_id = %self.application_id,
            group = %self.application_group_name,
            members = members.len(),
            ok = result.is_ok(),
            "Set application group members"
        );
        result
    }

    // ========================================================================
    // Deferred user creation
    // ========================================================================

    fn schedule_user_creation(self: &Arc<Self>, failed_users: Vec<SecurityUserDescription>) -> Result<()> {
        let result = self.transition(PrincipalsState::RetryScheduling);
        if !self.check_transition(&result, PrincipalsState::RetryScheduling, true) {
            return result;
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            self.transition_to_failed();
            HostingError::OperationFailed(format!("no runtime for user creation retry: {e}"))
        })?;

        let result = self.transition(PrincipalsState::RetryScheduled);
        if !self.check_transition(&result, PrincipalsState::RetryScheduled, true) {
            return result;
        }

        let delay = self.settings.user_creation_retry_timeout;
        info!(
            app_id = %self.application_id,
            node_id = %self.node_id,
            users = failed_users.len(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling user creation retry"
        );

        let this = Arc::clone(self);
        let cancel = Arc::clone(&self.retry_cancel);
        let handle = runtime.spawn(async move {
            tokio::select! {
                biased;

                _ = cancel.notified() => {
                    debug!(app_id = %this.application_id, "User creation retry canceled");
                    return;
                }

                _ = tokio::time::sleep(delay) => {}
            }

            let app_id = this.application_id.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || this.retry_user_creation(failed_users)).await {
                warn!(app_id = %app_id, error = %e, "User creation retry task failed");
            }
        });

        *lock(&self.retry_handle) = Some(handle);
        Ok(())
    }

    fn retry_user_creation(self: &Arc<Self>, failed_users: Vec<SecurityUserDescription>) {
        let result = self.transition(PrincipalsState::UserCreationRetrying);
        if !self.check_transition(&result, PrincipalsState::UserCreationRetrying, true) {
            return;
        }

        let mut configure_group = false;
        let mut still_failing = Vec::new();
        for user in failed_users {
            match self.process_user(&user) {
                Ok(()) => {
                    debug!(app_id = %self.application_id, user = %user.name, "Deferred user created");
                    configure_group = true;
                }
                Err(e) => {
                    debug!(app_id = %self.application_id, user = %user.name, error = %e, "Deferred user still failing");
                    still_failing.push(user);
                }
            }
        }

        let mut group_result = Ok(());
        if configure_group {
            group_result = self.configure_application_group_and_membership();
            if let Err(e) = &group_result {
                warn!(app_id = %self.application_id, node_id = %self.node_id, error = %e, "Configuring application group during retry failed, retrying later");
            }
        }

        if !still_failing.is_empty() || group_result.is_err() {
            if let Err(e) = self.schedule_user_creation(still_failing) {
                warn!(app_id = %self.application_id, error = %e, "Rescheduling user creation failed");
            }
        } else {
            info!(app_id = %self.application_id, node_id = %self.node_id, "Deferred users created, principals opened");
            let result = self.transition(PrincipalsState::Opened);
            self.check_transition(&result, PrincipalsState::Opened, true);
        }
    }

    // ========================================================================
    // Update and queries
    // ========================================================================

    /// Add users declared by an application upgrade.
    ///
    /// Groups cannot change; users already present are skipped.
    pub fn update_application_principals(&self, request: ConfigureSecurityPrincipalRequest) -> Result<()> {
        if !request.update_existing {
            warn!(app_id = %self.application_id, "Principals update requested without update_existing");
            return Err(HostingError::invalid_state("update_existing", "create"));
        }
        if request.application_id != self.application_id || request.node_id != self.node_id {
            return Err(HostingError::InvalidArgument(format!(
                "principals update for {}/{} sent to {}/{}",
                request.application_id, request.node_id, self.application_id, self.node_id
            )));
        }

        {
            let principals = lock(&self.principals);
            let current = &principals.description.groups;
            let incoming = &request.principals.groups;
            if current.len() != incoming.len()
                || incoming.iter().any(|g| !current.iter().any(|c| c.name == g.name))
            {
                return Err(HostingError::InvalidArgument(format!(
                    "principal groups of {} cannot change on update",
                    self.application_id
                )));
            }
        }

        self.transition(PrincipalsState::UpdatingPrincipal)?;

        let mut configure_group = false;
        for user in request.principals.users {
            let exists = lock(&self.principals)
                .description
                .users
                .iter()
                .any(|u| u.name == user.name);
            if exists {
                debug!(app_id = %self.application_id, user = %user.name, "User already set up, skipping");
                continue;
            }

            if let Err(e) = self.process_user(&user) {
                warn!(app_id = %self.application_id, user = %user.name, error = %e, "Adding user during update failed");
                self.transition_to_failed();
                return Err(HostingError::ApplicationPrincipalAbortable);
            }
            configure_group = true;
            lock(&self.principals).description.users.push(user);
        }

        if configure_group {
            if let Err(e) = self.configure_application_group_and_membership() {
                warn!(app_id = %self.application_id, error = %e, "Configuring application group during update failed");
                self.transition_to_failed();
                return Err(HostingError::ApplicationPrincipalAbortable);
            }
        }

        let result = self.transition(PrincipalsState::Opened);
        if !self.check_transition(&result, PrincipalsState::Opened, true) {
            return Err(HostingError::ApplicationPrincipalAbortable);
        }
        Ok(())
    }

    /// Name, account name, SID and locality of every principal, users first.
    pub fn get_security_principal_information(&self) -> Result<Vec<PrincipalInformation>> {
        let previous = self.begin_query()?;

        let information = {
            let principals = lock(&self.principals);
            principals
                .users
                .iter()
                .map(|u| PrincipalInformation {
                    name: u.name.clone(),
                    account_name: u.name.clone(),
                    sid: u.sid.clone(),
                    is_local_user: u.is_local_user(),
                })
                .chain(principals.groups.iter().map(|g| PrincipalInformation {
                    name: g.name.clone(),
                    account_name: g.account_name.clone(),
                    sid: g.sid.clone(),
                    is_local_user: false,
                }))
                .collect()
        };

        self.end_query(previous)?;
        Ok(information)
    }

    pub fn get_security_user(&self, name: &str) -> Result<SecurityPrincipal> {
        self.find_principal(name, |p| &p.users)
    }

    pub fn get_security_group(&self, name: &str) -> Result<SecurityPrincipal> {
        self.find_principal(name, |p| &p.groups)
    }

    fn find_principal(
        &self,
        name: &str,
        select: impl Fn(&Principals) -> &Vec<SecurityPrincipal>,
    ) -> Result<SecurityPrincipal> {
        let previous = self.begin_query()?;
        let found = {
            let principals = lock(&self.principals);
            select(&principals)
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(name))
                .cloned()
        };
        self.end_query(previous)?;
        found.ok_or_else(|| HostingError::ApplicationPrincipalDoesNotExist(name.to_string()))
    }

    // ========================================================================
    // Close and cleanup
    // ========================================================================

    /// Close, deleting the accounts (`remove`) or only releasing them.
    pub fn close_application_principals(&self, remove: bool) -> Result<()> {
        lock(&self.principals).remove_on_close = remove;
        self.close()
    }

    pub fn close(&self) -> Result<()> {
        let result = self.transition(PrincipalsState::Closing);
        if !self.check_transition(&result, PrincipalsState::Closing, false) {
            return result;
        }

        self.cancel_retry();
        self.cleanup_application_principals();

        let result = self.transition(PrincipalsState::Closed);
        self.check_transition(&result, PrincipalsState::Closed, true);
        info!(app_id = %self.application_id, node_id = %self.node_id, "Closed application principals");
        result
    }

    /// Cancel the retry timer and clean up, whatever the current state.
    pub fn abort(&self) {
        warn!(app_id = %self.application_id, node_id = %self.node_id, state = %self.state(), "Aborting application principals");
        self.cancel_retry();
        self.cleanup_application_principals();
        self.transition_to_failed();
    }

    fn cancel_retry(&self) {
        self.retry_cancel.notify_one();
        if let Some(handle) = lock(&self.retry_handle).take() {
            handle.abort();
        }
    }

    fn cleanup_application_principals(&self) {
        let (groups, users, remove) = {
            let mut principals = lock(&self.principals);
            (
                std::mem::take(&mut principals.groups),
                std::mem::take(&mut principals.users),
                principals.remove_on_close,
            )
        };
        info!(app_id = %self.application_id, node_id = %self.node_id, remove, "Cleaning up application principals");

        let local_users = users.iter().filter(|u| u.is_local_user());
        if !remove {
            for principal in groups.iter().chain(local_users) {
                if let Err(e) = self.store.unload_account(&principal.account_name) {
                    warn!(app_id = %self.application_id, account = %principal.account_name, error = %e, "Unloading account failed");
                }
            }
            return;
        }

        for principal in groups.iter().chain(local_users) {
            if let Err(e) = self.delete_or_unload_security_principal(principal) {
                warn!(app_id = %self.application_id, account = %principal.account_name, error = %e, "Deleting account failed");
            }
        }
    }

    /// Release this node's claim on a principal, deleting it when no owner remains.
    fn delete_or_unload_security_principal(&self, principal: &SecurityPrincipal) -> Result<()> {
        if !principal.ntlm_authentication_enabled {
            return self.store.delete_account(&principal.account_name);
        }

        let kind = principal.account_kind();
        let account_name = &principal.account_name;
        let mutex_name = format!("{PRINCIPAL_MUTEX_PREFIX}{account_name}");
        self.locks.with_lock(&mutex_name, || {
            let comment = match self.store.get_comment(kind, account_name) {
                Ok(comment) => comment,
                Err(e) => {
                    assert!(
                        !e.is(ErrorCode::NotFound),
                        "reading the comment of {account_name} cannot fail with NotFound"
                    );
                    return Err(e);
                }
            };

            let ownership = is_principal_owned(&comment, &self.node_id, &self.application_id, false)
                .unwrap_or_else(|| {
                    panic!("comment '{comment}' for {account_name} should have node id {}", self.node_id)
                });

            if ownership.is_last_node {
                let result = self.store.delete_account(account_name);
                info!(app_id = %self.application_id, account = %account_name, ok = result.is_ok(), "Deleted shared account");
                return result;
            }

            let updated = remove_node_from_comment(&comment, &self.node_id, false)?;
            let result = self.store.update_comment(kind, account_name, &updated);
            info!(app_id = %self.application_id, account = %account_name, comment = %updated, "Released shared account");
            if let Err(e) = self.store.unload_account(account_name) {
                debug!(account = %account_name, error = %e, "Unloading account failed");
            }
            result
        })
    }

    /// Release every account claimed by `node_id` (and `application_id` when
    /// non-empty), deleting accounts this node was the last owner of.
    ///
    /// Used for maintenance after a node was removed without a clean close.
    pub fn cleanup_environment(
        store: &dyn AccountStore,
        locks: &NamedLocks,
        node_id: &str,
        application_id: &str,
    ) {
        info!(node_id = %node_id, app_id = %application_id, "Cleaning up principal environment");
        Self::cleanup_accounts(store, locks, AccountKind::Group, node_id, application_id, false);
        Self::cleanup_accounts(
            store,
            locks,
            AccountKind::User,
            node_id,
            application_id,
            application_id.is_empty(),
        );
    }

    fn cleanup_accounts(
        store: &dyn AccountStore,
        locks: &NamedLocks,
        kind: AccountKind,
        node_id: &str,
        application_id: &str,
        remove_all: bool,
    ) {
        let accounts = match store.list_accounts(kind) {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(node_id = %node_id, kind = %kind, error = %e, "Listing accounts failed");
                return;
            }
        };

        for account in accounts {
            let mutex_name = format!("{PRINCIPAL_MUTEX_PREFIX}{}", account.name);
            let result = locks.with_lock(&mutex_name, || {
                let Some(ownership) =
                    is_principal_owned(&account.comment, node_id, application_id, remove_all)
                else {
                    return Ok(());
                };
                if ownership.is_last_node {
                    store.delete_account(&account.name)
                } else {
                    let updated = remove_node_from_comment(&account.comment, node_id, remove_all)?;
                    store.update_comment(kind, &account.name, &updated)
                }
            });
            if let Err(e) = result {
                warn!(node_id = %node_id, account = %account.name, error = %e, "Cleaning up account failed");
            }
        }
    }
}

impl Drop for ApplicationPrincipals {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.retry_handle).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principals::comment::create_comment;
    use crate::principals::store::InMemoryAccountStore;

    const APP: &str = "CalcApp_App3";

    fn request(principals: PrincipalsDescription, node_id: &str) -> ConfigureSecurityPrincipalRequest {
        ConfigureSecurityPrincipalRequest {
            application_id: APP.into(),
            node_id: node_id.into(),
            application_package_counter: 3,
            principals,
            allowed_user_creation_failure_count: 1,
            update_existing: false,
        }
    }

    fn settings(ntlm: bool) -> PrincipalsSettings {
        PrincipalsSettings {
            ntlm_authentication_enabled: ntlm,
            user_creation_retry_timeout: Duration::from_millis(20),
        }
    }

    fn declared() -> PrincipalsDescription {
        PrincipalsDescription {
            users: vec![SecurityUserDescription::local("Worker").with_parent_groups(["Admins"])],
            groups: vec![SecurityGroupDescription::new("Admins")],
        }
    }

    #[test]
    fn test_group_name_format() {
        assert_eq!(ApplicationPrincipals::application_local_group_name("N1", 7), "WF-App-7-N1");
        assert_eq!(ApplicationPrincipals::shared_account_name("Worker", 7), "Worker7");
        assert_eq!(
            ApplicationPrincipals::shared_account_name("Worker", SYSTEM_APPLICATION_NUMBER),
            "Worker"
        );
    }

    #[tokio::test]
    async fn test_open_creates_principals_and_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let principals = ApplicationPrincipals::new(
            request(declared(), "N1"),
            settings(false),
            store.clone(),
            NamedLocks::new(dir.path()),
        );

        principals.open().unwrap();
        assert_eq!(principals.state(), PrincipalsState::Opened);

        let info = principals.get_security_principal_information().unwrap();
        assert_eq!(info.len(), 2);
        assert!(info[0].is_local_user);
        assert_eq!(principals.state(), PrincipalsState::Opened);

        let group = store.account("WF-App-3-N1").unwrap();
        assert_eq!(group.comment, APPLICATION_LOCAL_GROUP_COMMENT);
        assert_eq!(group.members, vec![info[0].sid.clone()]);

        assert!(principals.get_security_group("admins").is_ok());
        assert!(matches!(
            principals.get_security_user("Nobody"),
            Err(HostingError::ApplicationPrincipalDoesNotExist(_))
        ));

        principals.close().unwrap();
        assert_eq!(principals.state(), PrincipalsState::Closed);
        // Only the per-application group remains.
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_accounts_are_reference_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let locks = NamedLocks::new(dir.path());
        let description = PrincipalsDescription {
            users: vec![SecurityUserDescription::local("Worker")],
            groups: Vec::new(),
        };

        let first = ApplicationPrincipals::new(request(description.clone(), "N1"), settings(true), store.clone(), locks.clone());
        let second = ApplicationPrincipals::new(request(description, "N2"), settings(true), store.clone(), locks);
        first.open().unwrap();
        second.open().unwrap();

        assert_eq!(
            store.account("Worker3").unwrap().comment,
            create_comment("Worker", "N1,N2", APP)
        );

        first.close().unwrap();
        assert_eq!(
            store.account("Worker3").unwrap().comment,
            create_comment("Worker", "N2", APP)
        );

        second.close().unwrap();
        assert!(store.account("Worker3").is_none());
    }

    #[tokio::test]
    async fn test_malformed_shared_comment_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        store
            .create_account("Worker3", &AccountSpec::new(AccountKind::User, "WinFabApplication|broken"))
            .unwrap();

        let principals = ApplicationPrincipals::new(
            request(
                PrincipalsDescription {
                    users: vec![SecurityUserDescription::local("Worker")],
                    groups: Vec::new(),
                },
                "N1",
            ),
            settings(true),
            store,
            NamedLocks::new(dir.path()),
        );

        assert!(matches!(principals.open(), Err(HostingError::ApplicationPrincipalAbortable)));
        assert_eq!(principals.state(), PrincipalsState::Failed);
    }

    #[tokio::test]
    async fn test_update_adds_new_users_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let principals = ApplicationPrincipals::new(
            request(declared(), "N1"),
            settings(false),
            store,
            NamedLocks::new(dir.path()),
        );
        principals.open().unwrap();

        let mut update = request(declared(), "N1");
        update.update_existing = true;
        update.principals.users.push(SecurityUserDescription::local("Reader"));
        principals.update_application_principals(update).unwrap();

        assert_eq!(principals.state(), PrincipalsState::Opened);
        assert_eq!(principals.get_security_principal_information().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_rejects_changed_groups() {
        let dir = tempfile::tempdir().unwrap();
        let principals = ApplicationPrincipals::new(
            request(declared(), "N1"),
            settings(false),
            Arc::new(InMemoryAccountStore::new()),
            NamedLocks::new(dir.path()),
        );
        principals.open().unwrap();

        let mut update = request(declared(), "N1");
        update.update_existing = true;
        update.principals.groups = vec![SecurityGroupDescription::new("Other")];
        assert!(matches!(
            principals.update_application_principals(update),
            Err(HostingError::InvalidArgument(_))
        ));

        let not_update = request(declared(), "N1");
        assert!(matches!(
            principals.update_application_principals(not_update),
            Err(HostingError::InvalidState { .. })
        ));
        assert_eq!(principals.state(), PrincipalsState::Opened);
    }

    fn user_with_certificate(name: &str, thumbprint: &str) -> SecurityUserDescription {
        let mut user = SecurityUserDescription::local(name).with_parent_groups(["Admins"]);
        user.x509_find_value = thumbprint.into();
        user
    }

    async fn wait_for_state(principals: &ApplicationPrincipals, target: PrincipalsState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while principals.state() != target {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("principals stuck in {}, expected {target}", principals.state()));
    }

    #[tokio::test]
    async fn test_deferred_user_created_once_certificate_installed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let description = PrincipalsDescription {
            users: vec![user_with_certificate("Worker", "ABCD")],
            groups: vec![SecurityGroupDescription::new("Admins")],
        };
        let principals = ApplicationPrincipals::new(
            request(description, "N1"),
            settings(false),
            store.clone(),
            NamedLocks::new(dir.path()),
        );

        principals.open().unwrap();
        assert_eq!(principals.state(), PrincipalsState::RetryScheduled);
        assert!(matches!(
            principals.get_security_user("Worker"),
            Err(HostingError::ApplicationPrincipalDoesNotExist(_))
        ));
        assert_eq!(principals.state(), PrincipalsState::RetryScheduled);

        // A few retries run without the certificate and keep rescheduling.
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_ne!(principals.state(), PrincipalsState::Opened);
        assert_ne!(principals.state(), PrincipalsState::Failed);

        store.install_certificate("ABCD");
        wait_for_state(&principals, PrincipalsState::Opened).await;

        let worker = principals.get_security_user("Worker").unwrap();
        let group = store.account("WF-App-3-N1").unwrap();
        assert_eq!(group.members, vec![worker.sid]);

        principals.close().unwrap();
        assert_eq!(principals.state(), PrincipalsState::Closed);
    }

    #[tokio::test]
    async fn test_too_many_deferred_users_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryAccountStore::new());
        let description = PrincipalsDescription {
            users: vec![user_with_certificate("Worker", "ABCD"), user_with_certificate("Reader", "EF01")],
            groups: vec![SecurityGroupDescription::new("Admins")],
        };
        let principals = ApplicationPrincipals::new(
            request(description, "N1"),
            settings(false),
            store.clone(),
            NamedLocks::new(dir.path()),
        );

        assert!(matches!(principals.open(), Err(HostingError::ApplicationPrincipalAbortable)));
        assert_eq!(principals.state(), PrincipalsState::Failed);
        // The group was created before the second user failed.
        assert_eq!(store.len(), 1);

        principals.abort();
        assert_eq!(principals.state(), PrincipalsState::Failed);
        assert!(store.is_empty());

        // No retry was armed, so installing the certificates changes nothing.
        store.install_certificate("ABCD");
        store.install_certificate("EF01");
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(principals.state(), PrincipalsState::Failed);
        assert!(store.is_empty());
    }

    #[test]
    fn test_cleanup_environment_releases_node() {
        let dir = tempfile::tempdir().unwrap();
        let locks = NamedLocks::new(dir.path());
        let store = InMemoryAccountStore::new();
        store
            .create_account("Shared3", &AccountSpec::new(AccountKind::User, create_comment("Shared", "N1,N2", APP)))
            .unwrap();
        store
            .create_account("Solo3", &AccountSpec::new(AccountKind::User, create_comment("Solo", "N1", APP)))
            .unwrap();
        store
            .create_account("Admin", &AccountSpec::new(AccountKind::User, "built-in"))
            .unwrap();

        ApplicationPrincipals::cleanup_environment(&store, &locks, "N1", APP);

        assert_eq!(
            store.account("Shared3").unwrap().comment,
            create_comment("Shared", "N2", APP)
        );
        assert!(store.account("Solo3").is_none());
        assert!(store.account("Admin").is_some());
    }
}
