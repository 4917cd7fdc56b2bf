//! Row types owned by the CRUD layer that the core reads: contacts and
//! message templates. The core never writes these tables.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// A contact consumed by the template renderer and bulk engine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub company: String,
    pub position: String,
    pub group_id: Option<String>,
    pub is_active: bool,
}

impl Contact {
    /// Minimal contact carrying just a phone number, for request paths that
    /// pass raw numbers instead of contact ids.
    pub fn from_phone(phone: &str) -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            phone: phone.to_string(),
            email: String::new(),
            company: String::new(),
            position: String::new(),
            group_id: None,
            is_active: true,
        }
    }

    /// Placeholder lookup used by the renderer.
    pub fn field(&self, token: &str) -> Option<&str> {
        match token {
            "name" => Some(&self.name),
            "phone" => Some(&self.phone),
            "email" => Some(&self.email),
            "company" => Some(&self.company),
            "position" => Some(&self.position),
            _ => None,
        }
    }
}

/// A reusable outbound message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: String,
    pub name: String,
    pub content: String,
    pub template_type: String,
    pub category: String,
    pub variables: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    content: String,
    template_type: String,
    category: String,
    variables: String,
}

impl From<TemplateRow> for MessageTemplate {
    fn from(row: TemplateRow) -> Self {
        let variables = serde_json::from_str(&row.variables).unwrap_or_default();
        Self {
            id: row.id,
            name: row.name,
            content: row.content,
            template_type: row.template_type,
            category: row.category,
            variables,
        }
    }
}

/// Fetch active contacts by id, preserving the requested order.
pub async fn contacts_by_ids(pool: &SqlitePool, ids: &[String]) -> Result<Vec<Contact>> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let row: Option<Contact> =
            sqlx::query_as("SELECT * FROM contacts WHERE id = ?1 AND is_active = 1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        if let Some(contact) = row {
            out.push(contact);
        }
    }
    Ok(out)
}

/// Fetch all active contacts in a group.
pub async fn contacts_by_group(pool: &SqlitePool, group_id: &str) -> Result<Vec<Contact>> {
    let rows = sqlx::query_as(
        "SELECT * FROM contacts WHERE group_id = ?1 AND is_active = 1 ORDER BY name ASC",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch a message template by id.
pub async fn template_by_id(pool: &SqlitePool, id: &str) -> Result<Option<MessageTemplate>> {
    let row: Option<TemplateRow> = sqlx::query_as("SELECT * FROM message_templates WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(MessageTemplate::from))
}

#[cfg(test)]
pub(crate) async fn insert_contact(pool: &SqlitePool, contact: &Contact) {
    sqlx::query(
        "INSERT INTO contacts (id, name, phone, email, company, position, group_id, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&contact.id)
    .bind(&contact.name)
    .bind(&contact.phone)
    .bind(&contact.email)
    .bind(&contact.company)
    .bind(&contact.position)
    .bind(&contact.group_id)
    .bind(contact.is_active)
    .execute(pool)
    .await
    .expect("insert contact");
}

#[cfg(test)]
pub(crate) async fn insert_template(pool: &SqlitePool, template: &MessageTemplate) {
    sqlx::query(
        "INSERT INTO message_templates (id, name, content, template_type, category, variables)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.content)
    .bind(&template.template_type)
    .bind(&template.category)
    .bind(serde_json::to_string(&template.variables).expect("variables"))
    .execute(pool)
    .await
    .expect("insert template");
}
