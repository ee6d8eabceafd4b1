// SPDX-License-Identifier: Apache-2.0

pub mod beater;
pub mod bounded_channel;
pub mod error;
pub mod event;
pub mod harvester;
pub mod init;
pub mod input;
pub mod parser;
pub mod prospector;
pub mod publisher;
pub mod registry;
pub mod sink;
pub mod spooler;
