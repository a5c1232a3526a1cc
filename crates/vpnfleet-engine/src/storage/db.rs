//! SQLite database for the vpnfleet engine.

vpnfleet_core::define_database!(FleetDatabase, "Fleet database migrations complete");
