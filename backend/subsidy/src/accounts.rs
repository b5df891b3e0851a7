//! Producer accounts and project registration.
//!
//! Plain record management: the only rules are uniqueness of emails and GST
//! numbers, and that projects belong to an existing producer.

use chrono::Utc;
use rand::RngCore;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{is_unique_violation, Result, SubsidyError};
use crate::models::{Credentials, Project, ProjectStatus, Role, User};

const SALT_LEN: usize = 16;

/// Register a new producer company.
pub async fn register_producer(
    pool: &SqlitePool,
    name: &str,
    email: &str,
    gst_number: &str,
    password: &str,
) -> Result<User> {
    let name = name.trim();
    let email = email.trim().to_lowercase();
    let gst_number = gst_number.trim().to_uppercase();
    if name.is_empty() || email.is_empty() || gst_number.is_empty() || password.is_empty() {
        return Err(SubsidyError::Validation(
            "name, email, GST number and password are required".to_string(),
        ));
    }

    let salt = generate_salt();
    let user = User {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        email,
        gst_number: Some(gst_number),
        role: Role::Producer,
        created_at: Utc::now(),
    };

    let inserted = sqlx::query(
        r#"
        INSERT INTO users
            (id, name, email, gst_number, password_hash, password_salt, role, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(&user.gst_number)
    .bind(hash_password(&salt, password))
    .bind(&salt)
    .bind(user.role)
    .bind(user.created_at)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {
            info!("Registered producer {}", user.id);
            Ok(user)
        }
        Err(e) if is_unique_violation(&e) => Err(SubsidyError::Conflict(
            "a company with this email or GST number is already registered".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Check a producer's credentials and return their user id.
pub async fn login_producer(pool: &SqlitePool, email: &str, password: &str) -> Result<String> {
    let creds: Option<Credentials> = sqlx::query_as(
        "SELECT id, password_hash, password_salt FROM users WHERE email = ?1 AND role = ?2",
    )
    .bind(email.trim().to_lowercase())
    .bind(Role::Producer)
    .fetch_optional(pool)
    .await?;

    match creds {
        Some(c) if hash_password(&c.password_salt, password) == c.password_hash => Ok(c.id),
        _ => {
            warn!("Rejected login attempt");
            Err(SubsidyError::InvalidCredentials)
        }
    }
}

/// Register a project for `producer_id` with the configured production estimate.
pub async fn register_project(
    pool: &SqlitePool,
    name: &str,
    producer_id: &str,
    estimated_production: Decimal,
) -> Result<Project> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SubsidyError::Validation("project name is required".to_string()));
    }
    if !db::producer_exists(pool, producer_id).await? {
        return Err(SubsidyError::NotFoundOrForbidden(format!(
            "producer {producer_id}"
        )));
    }

    let project = Project {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        producer_id: producer_id.to_string(),
        estimated_production,
        total_subsidy_allocated: Decimal::ZERO,
        status: ProjectStatus::PendingApproval,
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO projects
            (id, name, producer_id, estimated_production, total_subsidy_allocated, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(&project.producer_id)
    .bind(project.estimated_production.to_string())
    .bind(project.total_subsidy_allocated.to_string())
    .bind(project.status)
    .bind(project.created_at)
    .execute(pool)
    .await?;

    info!(
        "Project '{}' ({}) registered and pending approval",
        project.name, project.id
    );
    Ok(project)
}

fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
