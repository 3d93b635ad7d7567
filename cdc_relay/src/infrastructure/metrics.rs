// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Prometheus metrics: the registry-owning service and the scrape endpoint.

pub mod endpoint;
pub mod service;

pub use endpoint::MetricsEndpoint;
pub use service::MetricsService;
