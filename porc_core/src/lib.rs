/*!
Core of a porc onion-routing relay.

A relay accepts secured connections, bootstraps every connection into one keyed
circuit hop and forwards relay frames along circuits, removing one onion layer
downstream and adding one upstream.

*/

#![forbid(unsafe_code)]
// Remove it when it will be fixed in nom parser
#![allow(clippy::redundant_closure)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate cookie_factory;

pub mod relay;
