/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod activity;
pub mod audience;
pub mod config;
pub mod context;
pub mod db;
pub mod delivery;
pub mod federation;
pub mod graph;
pub mod http_sig;
pub mod keys;
pub mod lifecycle;
pub mod replies;
pub mod store;
pub mod thread;
pub mod tripcode;
