mod session_scenarios;
