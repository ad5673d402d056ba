// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only utilities and mock implementations for the shared folder cache
//!
//! `mock_provider` wires a `MockProvider` to a small in-memory host tree so
//! cache tests can exercise whole operations without a real directory.

#[cfg(test)]
pub mod mock_provider;
