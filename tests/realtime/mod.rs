mod bridge_tests;
mod tcp_tests;
mod websocket_tests;
