//! Plain-text rendering of daemon state and client events.

use std::fmt::Write;

use berth_client::{ClientEvent, Health};
use berth_types::{ApiMessage, DaemonInfo, Resource};
use chrono::{DateTime, Local};

const TABLE_HEADERS: [&str; 5] = ["ID", "NAME", "IMAGE", "STATE", "CREATED"];

#[must_use]
pub fn info_text(info: &DaemonInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ID:          {}", info.id);
    if let Some(name) = &info.name {
        let _ = writeln!(out, "Name:        {name}");
    }
    if let Some(version) = &info.server_version {
        let _ = writeln!(out, "Version:     {version}");
    }
    let _ = writeln!(
        out,
        "Containers:  {} ({} running, {} paused, {} stopped)",
        info.containers, info.containers_running, info.containers_paused, info.containers_stopped
    );
    let _ = write!(out, "Images:      {}", info.images);
    out
}

fn created_text(created: i64) -> String {
    DateTime::from_timestamp(created, 0).map_or_else(
        || created.to_string(),
        |utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        },
    )
}

/// Column-aligned resource table, header first.
#[must_use]
pub fn resource_table(resources: &[Resource]) -> String {
    let rows: Vec<[String; 5]> = resources
        .iter()
        .map(|r| {
            [
                r.short_id().to_string(),
                r.name().to_string(),
                r.image.clone(),
                r.state.clone(),
                created_text(r.created),
            ]
        })
        .collect();

    let mut widths = TABLE_HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header = TABLE_HEADERS.map(ToString::to_string);
    for row in std::iter::once(&header).chain(&rows) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }
    out.truncate(out.trim_end().len());
    out
}

/// One-line summary of an event for `watch`.
#[must_use]
pub fn event_line(event: &ClientEvent) -> String {
    match event {
        ClientEvent::Health(Health::Connected) => "connected".to_string(),
        ClientEvent::Health(Health::Disconnected { reason }) => {
            format!("disconnected: {reason}")
        }
        ClientEvent::Message(message) => message_line(message),
        ClientEvent::Failed(signal) => format!("error: {signal}"),
        ClientEvent::Malformed { reason } => format!("malformed response: {reason}"),
        ClientEvent::ActionRejected { action, reason } => {
            format!("rejected {action}: {reason}")
        }
    }
}

fn message_line(message: &ApiMessage) -> String {
    match message {
        ApiMessage::Info(info) => format!(
            "info: {} containers ({} running), {} images",
            info.containers, info.containers_running, info.images
        ),
        ApiMessage::ResourceList { resources } => {
            let active: Vec<&str> = resources
                .iter()
                .filter(|r| r.is_active())
                .map(Resource::name)
                .collect();
            format!(
                "resources: {} total, running [{}]",
                resources.len(),
                active.join(", ")
            )
        }
        ApiMessage::Message { text } => format!("message: {text}"),
        ApiMessage::NoContent => "ok".to_string(),
        ApiMessage::UnknownBody { raw } => format!("unrecognised body: {raw}"),
    }
}
