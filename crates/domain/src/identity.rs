//! Users, roles and role assignments.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{EntityKey, RoleId, UserId, UserRoleId};
use serde::{Deserialize, Serialize};
use store::{
    Auditable, CancellationToken, Clock, ConcurrencyToken, Entity, Specification, Store,
    SystemClock, UnitOfWork,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{DomainError, Result};
use crate::{ErrorKind, refreshed, specifications};

/// Errors that can occur during identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("User name is required")]
    UserNameRequired,

    #[error("Role name is required")]
    RoleNameRequired,

    #[error("Role {name} already exists")]
    RoleAlreadyExists { name: String },

    #[error("Role {role_id} is already assigned to user {user_id}")]
    RoleAlreadyAssigned { user_id: UserId, role_id: RoleId },
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::UserNameRequired | IdentityError::RoleNameRequired => {
                ErrorKind::Validation
            }
            IdentityError::RoleAlreadyExists { .. } | IdentityError::RoleAlreadyAssigned { .. } => {
                ErrorKind::InvariantViolation
            }
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            IdentityError::UserNameRequired => 6001,
            IdentityError::RoleNameRequired => 6002,
            IdentityError::RoleAlreadyExists { .. } => 6003,
            IdentityError::RoleAlreadyAssigned { .. } => 6004,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    id: UserId,
    user_name: String,
    email: String,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    token: ConcurrencyToken,

    /// Filled by the `roles` include.
    #[serde(skip)]
    roles: Vec<UserRole>,
}

impl User {
    pub fn new(
        user_name: impl Into<String>,
        email: impl Into<String>,
    ) -> std::result::Result<Self, IdentityError> {
        let user_name = user_name.into();
        if user_name.trim().is_empty() {
            return Err(IdentityError::UserNameRequired);
        }
        Ok(Self {
            id: UserId::default(),
            user_name,
            email: email.into(),
            created_at: None,
            updated_at: None,
            token: ConcurrencyToken::initial(),
            roles: Vec::new(),
        })
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn roles(&self) -> &[UserRole] {
        &self.roles
    }

    pub fn has_role(&self, role_id: RoleId) -> bool {
        self.roles.iter().any(|r| r.role_id == role_id)
    }

    pub(crate) fn set_roles(&mut self, roles: Vec<UserRole>) {
        self.roles = roles;
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = UserId::new(key);
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }

    fn auditable(&mut self) -> Option<&mut dyn Auditable> {
        Some(self)
    }
}

impl Auditable for User {
    fn touch_created(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
        self.updated_at = Some(at);
    }

    fn touch_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    id: RoleId,
    name: String,

    #[serde(skip)]
    token: ConcurrencyToken,
}

impl Role {
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, IdentityError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(IdentityError::RoleNameRequired);
        }
        Ok(Self {
            id: RoleId::default(),
            name,
            token: ConcurrencyToken::initial(),
        })
    }

    pub fn id(&self) -> RoleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Entity for Role {
    const TABLE: &'static str = "roles";

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = RoleId::new(key);
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }
}

/// Assignment of a role to a user. Stored under the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    id: UserRoleId,
    user_id: UserId,
    role_id: RoleId,

    #[serde(skip)]
    token: ConcurrencyToken,
}

impl UserRole {
    pub fn new(user_id: UserId, role_id: RoleId) -> Self {
        Self {
            id: UserRoleId::default(),
            user_id,
            role_id,
            token: ConcurrencyToken::initial(),
        }
    }

    pub fn id(&self) -> UserRoleId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn role_id(&self) -> RoleId {
        self.role_id
    }
}

impl Entity for UserRole {
    const TABLE: &'static str = "user_roles";

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = UserRoleId::new(key);
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }

    fn parent_key(&self) -> Option<EntityKey> {
        Some(self.user_id.key())
    }
}

/// Service for users and their roles.
pub struct IdentityService<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> IdentityService<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::with_clock(self.store.clone(), self.clock.clone())
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn create_user(
        &self,
        user_name: &str,
        email: &str,
        cancel: &CancellationToken,
    ) -> Result<User> {
        let user = User::new(user_name, email)?;
        let mut uow = self.unit_of_work();
        let user = uow.repository::<User>().create(user, cancel).await?;
        uow.save_changes(cancel).await?;
        info!(user_id = %user.id(), "User created");
        Ok(refreshed(&uow, user))
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn create_role(&self, name: &str, cancel: &CancellationToken) -> Result<Role> {
        let role = Role::new(name)?;
        let mut uow = self.unit_of_work();
        let mut roles = uow.repository::<Role>();
        if roles.any(&specifications::role_by_name(name), cancel).await? {
            return Err(IdentityError::RoleAlreadyExists {
                name: name.to_string(),
            }
            .into());
        }
        let role = roles.create(role, cancel).await?;
        uow.save_changes(cancel).await?;
        Ok(refreshed(&uow, role))
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn assign_role(
        &self,
        user_id: UserId,
        role_id: RoleId,
        cancel: &CancellationToken,
    ) -> Result<UserRole> {
        let mut uow = self.unit_of_work();
        ensure_user_exists(&mut uow, user_id, cancel).await?;
        ensure_roles_exist(&mut uow, &[role_id], cancel).await?;

        let mut assignments = uow.repository::<UserRole>();
        if assignments
            .any(&specifications::user_role(user_id, role_id), cancel)
            .await?
        {
            return Err(IdentityError::RoleAlreadyAssigned { user_id, role_id }.into());
        }
        let assignment = assignments
            .create(UserRole::new(user_id, role_id), cancel)
            .await?;
        uow.save_changes(cancel).await?;
        Ok(assignment)
    }

    /// Returns the names of the user's roles without loading the user.
    pub async fn role_names_for_user(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut uow = self.unit_of_work();
        let role_ids = uow
            .repository::<UserRole>()
            .list_values(
                &specifications::user_roles_for_user(user_id),
                |assignment| assignment.role_id().key(),
                cancel,
            )
            .await?;
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(uow
            .repository::<Role>()
            .list_values(
                &Specification::for_keys(role_ids),
                |role| role.name().to_string(),
                cancel,
            )
            .await?)
    }

    /// Loads a read-only user with role assignments.
    pub async fn get_user_with_roles(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<User> {
        let mut uow = self.unit_of_work();
        uow.repository::<User>()
            .first_or_default(&specifications::user_by_id_with_roles(user_id), cancel)
            .await?
            .ok_or_else(|| DomainError::not_found("User", user_id))
    }

    /// Replaces every role of a user.
    ///
    /// Existing assignments are removed and saved first, then the new set is
    /// created and saved, both inside one explicit transaction. Any failure
    /// rolls back both steps. A role listed more than once is assigned once.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn swap_roles(
        &self,
        user_id: UserId,
        role_ids: &[RoleId],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut uow = self.unit_of_work();
        uow.begin_transaction(cancel).await?;

        match replace_roles(&mut uow, user_id, role_ids, cancel).await {
            Ok(()) => {
                uow.commit_transaction(cancel).await?;
                info!(%user_id, roles = role_ids.len(), "User roles swapped");
                Ok(())
            }
            Err(e) => {
                warn!(%user_id, error = %e, "Role swap failed, rolling back");
                if uow.in_transaction() {
                    uow.rollback_transaction(cancel).await?;
                }
                Err(e)
            }
        }
    }
}

async fn replace_roles<S: Store>(
    uow: &mut UnitOfWork<S>,
    user_id: UserId,
    role_ids: &[RoleId],
    cancel: &CancellationToken,
) -> Result<()> {
    ensure_user_exists(uow, user_id, cancel).await?;

    let mut assignments = uow.repository::<UserRole>();
    let current = assignments
        .list(&specifications::user_roles_for_user(user_id), cancel)
        .await?;
    assignments.remove_range(&current)?;
    uow.save_changes(cancel).await?;

    let mut unique: Vec<RoleId> = Vec::with_capacity(role_ids.len());
    for role_id in role_ids {
        if !unique.contains(role_id) {
            unique.push(*role_id);
        }
    }

    ensure_roles_exist(uow, &unique, cancel).await?;
    let mut assignments = uow.repository::<UserRole>();
    for role_id in unique {
        assignments
            .create(UserRole::new(user_id, role_id), cancel)
            .await?;
    }
    uow.save_changes(cancel).await?;
    Ok(())
}

async fn ensure_user_exists<S: Store>(
    uow: &mut UnitOfWork<S>,
    user_id: UserId,
    cancel: &CancellationToken,
) -> Result<()> {
    let exists = uow
        .repository::<User>()
        .any(&Specification::for_key(user_id), cancel)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(DomainError::not_found("User", user_id))
    }
}

async fn ensure_roles_exist<S: Store>(
    uow: &mut UnitOfWork<S>,
    role_ids: &[RoleId],
    cancel: &CancellationToken,
) -> Result<()> {
    let found = uow
        .repository::<Role>()
        .list_values(
            &Specification::for_keys(role_ids.iter().map(|id| id.key())),
            Role::id,
            cancel,
        )
        .await?;
    match role_ids.iter().find(|id| !found.contains(id)) {
        Some(missing) => Err(DomainError::not_found("Role", *missing)),
        None => Ok(()),
    }
}
